//! CUDA backend.
//!
//! ASSUMPTIONS:
//! - One `CudaContext` and its default stream per device ordinal, created on
//!   first use and kept for the lifetime of the runtime
//! - Peer access goes through the driver API (`cuCtxEnablePeerAccess` is
//!   issued with the owning context bound to the calling thread)
//! - Kernels are compiled once per process with NVRTC and loaded into each
//!   context lazily
//! - `STATIC_WIDTH` is passed to NVRTC so the static scratch buffer matches
//!   `p2p_core::STATIC_WIDTH`

use crate::runtime::{AcceleratorRuntime, DeviceBuffer};
use cudarc::driver::sys as cuda_sys;
use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, DevicePtr, DevicePtrMut, LaunchConfig,
    PushKernelArg,
};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions, Ptx};
use p2p_core::{DeviceId, KernelLaunchConfig, KernelVariant, P2pError, Result, STATIC_WIDTH};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

const TRANSPOSE_SRC: &str = include_str!("kernels/transpose.cu");

fn check(result: cuda_sys::CUresult, call: &str) -> Result<()> {
    if result == cuda_sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(P2pError::runtime(call, format!("{:?}", result)))
    }
}

/// Whether libcuda can be loaded. cudarc panics on the first driver call
/// otherwise.
pub fn driver_present() -> bool {
    unsafe { cuda_sys::is_culib_present() }
}

fn driver_err(call: &'static str) -> impl FnOnce(cudarc::driver::DriverError) -> P2pError {
    move |e| P2pError::runtime(call, e)
}

/// `f32` allocation on one CUDA device.
pub struct CudaBuffer {
    device: DeviceId,
    slice: CudaSlice<f32>,
}

impl DeviceBuffer for CudaBuffer {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn len(&self) -> usize {
        self.slice.len()
    }
}

struct TransposeKernels {
    static_fn: CudaFunction,
    dynamic_fn: CudaFunction,
}

struct DeviceSlot {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    kernels: Option<TransposeKernels>,
}

/// Driver-API runtime over cudarc.
pub struct CudaRuntime {
    device_count: usize,
    slots: Mutex<HashMap<usize, DeviceSlot>>,
    ptx: Mutex<Option<Ptx>>,
}

impl CudaRuntime {
    /// Initializes the driver and counts devices. No context is created yet.
    ///
    /// Fails with a `cuInit` runtime-call error when the driver library
    /// cannot be loaded.
    pub fn new() -> Result<Self> {
        if !driver_present() {
            return Err(P2pError::runtime("cuInit", "driver library not found"));
        }
        unsafe { check(cuda_sys::cuInit(0), "cuInit")? };
        let count = CudaContext::device_count().map_err(driver_err("cuDeviceGetCount"))?;
        let device_count = usize::try_from(count)
            .map_err(|_| P2pError::resource(format!("driver reported {} devices", count)))?;

        log::info!("CUDA driver initialized: {} device(s)", device_count);

        Ok(Self {
            device_count,
            slots: Mutex::new(HashMap::new()),
            ptx: Mutex::new(None),
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<usize, DeviceSlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_device(&self, call: &str, device: DeviceId) -> Result<()> {
        if device.0 >= self.device_count {
            return Err(P2pError::runtime(call, "CUDA_ERROR_INVALID_DEVICE"));
        }
        Ok(())
    }

    fn slot<'a>(
        &self,
        slots: &'a mut HashMap<usize, DeviceSlot>,
        device: DeviceId,
    ) -> Result<&'a mut DeviceSlot> {
        self.check_device("cuCtxCreate", device)?;
        if !slots.contains_key(&device.0) {
            let context = CudaContext::new(device.ordinal()).map_err(driver_err("cuDevicePrimaryCtxRetain"))?;
            let stream = context.default_stream();
            log::debug!("Created CUDA context for {}", device);
            slots.insert(
                device.0,
                DeviceSlot {
                    context,
                    stream,
                    kernels: None,
                },
            );
        }
        slots
            .get_mut(&device.0)
            .ok_or_else(|| P2pError::resource(format!("no context for {}", device)))
    }

    fn cu_device(&self, device: DeviceId) -> Result<cuda_sys::CUdevice> {
        self.check_device("cuDeviceGet", device)?;
        let mut handle: cuda_sys::CUdevice = 0;
        unsafe { check(cuda_sys::cuDeviceGet(&mut handle, device.0 as i32), "cuDeviceGet")? };
        Ok(handle)
    }

    fn transpose_ptx(&self) -> Result<Ptx> {
        let mut cached = self.ptx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(ptx) = cached.as_ref() {
            return Ok(ptx.clone());
        }

        log::info!("Compiling transpose kernels (STATIC_WIDTH={})", STATIC_WIDTH);
        let ptx = compile_ptx_with_opts(
            TRANSPOSE_SRC,
            CompileOptions {
                options: vec![format!("-DSTATIC_WIDTH={}", STATIC_WIDTH)],
                ..Default::default()
            },
        )
        .map_err(|e| P2pError::runtime("nvrtcCompileProgram", e))?;

        *cached = Some(ptx.clone());
        Ok(ptx)
    }

    fn kernels<'a>(&self, slot: &'a mut DeviceSlot) -> Result<&'a TransposeKernels> {
        if slot.kernels.is_none() {
            let module = slot
                .context
                .load_module(self.transpose_ptx()?)
                .map_err(driver_err("cuModuleLoadData"))?;
            let static_fn = module
                .load_function(KernelVariant::Static.entry_point())
                .map_err(driver_err("cuModuleGetFunction"))?;
            let dynamic_fn = module
                .load_function(KernelVariant::Dynamic.entry_point())
                .map_err(driver_err("cuModuleGetFunction"))?;
            slot.kernels = Some(TransposeKernels {
                static_fn,
                dynamic_fn,
            });
        }
        slot.kernels
            .as_ref()
            .ok_or_else(|| P2pError::resource("transpose kernels not loaded"))
    }
}

impl AcceleratorRuntime for CudaRuntime {
    type Buffer = CudaBuffer;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.device_count)
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool> {
        let dev = self.cu_device(device)?;
        let peer_dev = self.cu_device(peer)?;
        let mut can_access: i32 = 0;
        unsafe {
            check(
                cuda_sys::cuDeviceCanAccessPeer(&mut can_access, dev, peer_dev),
                "cuDeviceCanAccessPeer",
            )?
        };
        Ok(can_access != 0)
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()> {
        let mut slots = self.slots();
        let peer_ctx = self.slot(&mut slots, peer)?.context.cu_ctx();
        let slot = self.slot(&mut slots, device)?;
        slot.context
            .bind_to_thread()
            .map_err(driver_err("cuCtxSetCurrent"))?;

        let result = unsafe { cuda_sys::cuCtxEnablePeerAccess(peer_ctx, 0) };
        if result == cuda_sys::CUresult::CUDA_ERROR_PEER_ACCESS_ALREADY_ENABLED {
            return Err(P2pError::link_state(device, peer, "peer access already enabled"));
        }
        check(result, "cuCtxEnablePeerAccess")
    }

    fn disable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()> {
        let mut slots = self.slots();
        let peer_ctx = self.slot(&mut slots, peer)?.context.cu_ctx();
        let slot = self.slot(&mut slots, device)?;
        slot.context
            .bind_to_thread()
            .map_err(driver_err("cuCtxSetCurrent"))?;

        let result = unsafe { cuda_sys::cuCtxDisablePeerAccess(peer_ctx) };
        if result == cuda_sys::CUresult::CUDA_ERROR_PEER_ACCESS_NOT_ENABLED {
            return Err(P2pError::link_state(device, peer, "peer access not enabled"));
        }
        check(result, "cuCtxDisablePeerAccess")
    }

    fn alloc(&self, device: DeviceId, len: usize) -> Result<CudaBuffer> {
        let mut slots = self.slots();
        let slot = self.slot(&mut slots, device)?;
        let slice = slot.stream.alloc_zeros::<f32>(len).map_err(|e| {
            P2pError::resource(format!("allocating {} floats on {}: {}", len, device, e))
        })?;
        Ok(CudaBuffer { device, slice })
    }

    fn upload(&self, device: DeviceId, host: &[f32]) -> Result<CudaBuffer> {
        let mut slots = self.slots();
        let slot = self.slot(&mut slots, device)?;
        let slice = slot.stream.clone_htod(host).map_err(driver_err("cuMemcpyHtoDAsync"))?;
        Ok(CudaBuffer { device, slice })
    }

    fn download(&self, buffer: &CudaBuffer) -> Result<Vec<f32>> {
        let mut slots = self.slots();
        let slot = self.slot(&mut slots, buffer.device)?;
        slot.stream
            .clone_dtoh(&buffer.slice)
            .map_err(driver_err("cuMemcpyDtoHAsync"))
    }

    fn write(&self, dst: &mut CudaBuffer, host: &[f32]) -> Result<()> {
        if host.len() > dst.slice.len() {
            return Err(P2pError::transfer(format!(
                "{} host elements do not fit a {}-element buffer on {}",
                host.len(),
                dst.slice.len(),
                dst.device
            )));
        }
        let mut slots = self.slots();
        let slot = self.slot(&mut slots, dst.device)?;
        let mut view = dst.slice.slice_mut(..host.len());
        slot.stream
            .memcpy_htod(host, &mut view)
            .map_err(driver_err("cuMemcpyHtoDAsync"))
    }

    fn copy_peer(&self, dst: &mut CudaBuffer, src: &CudaBuffer, size_bytes: usize) -> Result<()> {
        let mut slots = self.slots();
        let src_slot = self.slot(&mut slots, src.device)?;
        let src_ctx = src_slot.context.cu_ctx();
        // Slice events belong to the owning context; record them on its stream.
        let src_stream = Arc::clone(&src_slot.stream);
        let dst_slot = self.slot(&mut slots, dst.device)?;
        let stream = Arc::clone(&dst_slot.stream);
        let dst_ctx = dst_slot.context.cu_ctx();

        let (src_ptr, _src_sync) = src.slice.device_ptr(&src_stream);
        let (dst_ptr, _dst_sync) = dst.slice.device_ptr_mut(&stream);
        unsafe {
            check(
                cuda_sys::cuMemcpyPeerAsync(
                    dst_ptr,
                    dst_ctx,
                    src_ptr,
                    src_ctx,
                    size_bytes,
                    stream.cu_stream(),
                ),
                "cuMemcpyPeerAsync",
            )
        }
    }

    fn launch_transpose(
        &self,
        device: DeviceId,
        variant: KernelVariant,
        config: &KernelLaunchConfig,
        input: &CudaBuffer,
        output: &mut CudaBuffer,
        width: usize,
    ) -> Result<()> {
        let mut slots = self.slots();
        let slot = self.slot(&mut slots, device)?;
        let stream = Arc::clone(&slot.stream);
        let kernels = self.kernels(slot)?;
        let function = match variant {
            KernelVariant::Static => &kernels.static_fn,
            KernelVariant::Dynamic => &kernels.dynamic_fn,
        };

        let launch_config = LaunchConfig {
            grid_dim: config.grid_dim,
            block_dim: config.block_dim,
            shared_mem_bytes: config.shared_mem_bytes,
        };
        let width = width as u32;

        unsafe {
            stream
                .launch_builder(function)
                .arg(&mut output.slice)
                .arg(&input.slice)
                .arg(&width)
                .launch(launch_config)
                .map_err(driver_err("cuLaunchKernel"))?;
        }
        Ok(())
    }

    fn synchronize(&self, device: DeviceId) -> Result<()> {
        let mut slots = self.slots();
        let slot = self.slot(&mut slots, device)?;
        slot.stream
            .synchronize()
            .map_err(driver_err("cuStreamSynchronize"))
    }
}
