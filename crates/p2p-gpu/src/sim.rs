//! Host-emulated accelerator backend.
//!
//! Models N devices with a configurable peer-access relation and one
//! in-order queue per device. Launches and peer copies are queued and only
//! run when the device is synchronized or a buffer on it is downloaded, so
//! a missing host-side synchronization shows up as stale data or as a
//! rejected copy, the same way it would on hardware.
//!
//! The transpose kernel is emulated block by block with the two-phase
//! stage / barrier / write protocol of `kernels/transpose.cu`.
//!
//! Instrumentation (allocation count, live buffers, event log, per-launch
//! kernel statistics) and fault injection exist for tests.

use crate::runtime::{AcceleratorRuntime, DeviceBuffer};
use p2p_core::{DeviceId, KernelLaunchConfig, KernelVariant, P2pError, Result, STATIC_WIDTH};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Storage = Arc<Mutex<Vec<f32>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Buffer resident on an emulated device.
#[derive(Debug)]
pub struct SimBuffer {
    device: DeviceId,
    len: usize,
    data: Storage,
    live: Arc<AtomicUsize>,
}

impl DeviceBuffer for SimBuffer {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Issued runtime operation, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Alloc { device: DeviceId, len: usize },
    Upload { device: DeviceId, len: usize },
    Download { device: DeviceId, len: usize },
    Launch { device: DeviceId, variant: KernelVariant },
    PeerCopy { dst: DeviceId, src: DeviceId, bytes: usize },
    Synchronize { device: DeviceId, drained: usize },
    EnablePeer { device: DeviceId, peer: DeviceId },
    DisablePeer { device: DeviceId, peer: DeviceId },
}

/// Injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Adds 1.0 to the first element of every peer copy.
    CorruptPeerCopy,
    /// Allocations beyond the first `n` fail.
    FailAllocationAfter(usize),
    /// Kernel launches on this device fail at issue time.
    FailLaunchOn(DeviceId),
}

/// Per-launch counters gathered by the kernel emulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub blocks: usize,
    /// Threads that reached the block barrier.
    pub barrier_arrivals: usize,
    pub global_reads: usize,
    pub global_writes: usize,
    /// Threads outside the matrix; they touch no memory.
    pub idle_threads: usize,
}

enum QueuedOp {
    Launch {
        variant: KernelVariant,
        config: KernelLaunchConfig,
        width: usize,
        input: Storage,
        output: Storage,
    },
    PeerCopy {
        dst: Storage,
        src: Storage,
        len: usize,
    },
}

#[derive(Default)]
struct SimState {
    queues: Vec<VecDeque<QueuedOp>>,
    enabled: BTreeSet<(usize, usize)>,
    events: Vec<SimEvent>,
    allocations: usize,
    kernel_stats: Vec<KernelStats>,
}

/// Emulated multi-device runtime.
pub struct SimulatedRuntime {
    device_count: usize,
    /// `(device, peer)`: `device` can map `peer`'s memory.
    peer_access: HashSet<(usize, usize)>,
    faults: Vec<SimFault>,
    state: Mutex<SimState>,
    live: Arc<AtomicUsize>,
}

impl SimulatedRuntime {
    /// `device_count` devices where `device` can access `peer` for each
    /// `(device, peer)` in `peer_access`.
    pub fn new(device_count: usize, peer_access: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let peer_access = peer_access
            .into_iter()
            .filter(|&(d, p)| d != p && d < device_count && p < device_count)
            .collect();
        let state = SimState {
            queues: (0..device_count).map(|_| VecDeque::new()).collect(),
            ..SimState::default()
        };
        Self {
            device_count,
            peer_access,
            faults: Vec::new(),
            state: Mutex::new(state),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every ordered pair of distinct devices is peer-capable.
    pub fn fully_connected(device_count: usize) -> Self {
        let pairs: Vec<_> = (0..device_count)
            .flat_map(|d| (0..device_count).map(move |p| (d, p)))
            .collect();
        Self::new(device_count, pairs)
    }

    /// No device can access another.
    pub fn isolated(device_count: usize) -> Self {
        Self::new(device_count, std::iter::empty())
    }

    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Issued operations so far.
    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.state).events.clone()
    }

    /// Total successful allocations (uploads included).
    pub fn allocation_count(&self) -> usize {
        lock(&self.state).allocations
    }

    /// Buffers allocated and not yet dropped.
    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Links currently enabled, as `(device, peer)`.
    pub fn enabled_links(&self) -> Vec<(DeviceId, DeviceId)> {
        lock(&self.state)
            .enabled
            .iter()
            .map(|&(d, p)| (DeviceId(d), DeviceId(p)))
            .collect()
    }

    /// Statistics of every executed kernel, in execution order.
    pub fn kernel_stats(&self) -> Vec<KernelStats> {
        lock(&self.state).kernel_stats.clone()
    }

    /// Empties the event log and kernel statistics. Queues, links and
    /// counters are left alone.
    pub fn clear_instrumentation(&self) {
        let mut state = lock(&self.state);
        state.events.clear();
        state.kernel_stats.clear();
    }

    /// Operations queued on `device` and not yet executed.
    pub fn pending(&self, device: DeviceId) -> usize {
        lock(&self.state)
            .queues
            .get(device.0)
            .map_or(0, VecDeque::len)
    }

    fn has_fault(&self, fault: SimFault) -> bool {
        self.faults.contains(&fault)
    }

    fn check_device(&self, call: &str, device: DeviceId) -> Result<()> {
        if device.0 >= self.device_count {
            return Err(P2pError::runtime(call, "CUDA_ERROR_INVALID_DEVICE"));
        }
        Ok(())
    }

    fn new_buffer(&self, state: &mut SimState, device: DeviceId, data: Vec<f32>) -> Result<SimBuffer> {
        for fault in &self.faults {
            if let SimFault::FailAllocationAfter(limit) = *fault {
                if state.allocations >= limit {
                    return Err(P2pError::resource(format!(
                        "out of memory allocating {} bytes on {}",
                        data.len() * std::mem::size_of::<f32>(),
                        device
                    )));
                }
            }
        }
        state.allocations += 1;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(SimBuffer {
            device,
            len: data.len(),
            data: Arc::new(Mutex::new(data)),
            live: Arc::clone(&self.live),
        })
    }

    /// Runs every queued operation on `device` in issue order.
    fn drain(&self, state: &mut SimState, device: DeviceId) -> Result<usize> {
        let mut drained = 0;
        while let Some(op) = state.queues[device.0].pop_front() {
            drained += 1;
            match op {
                QueuedOp::Launch {
                    variant,
                    config,
                    width,
                    input,
                    output,
                } => {
                    let src = lock(&input).clone();
                    let mut dst = lock(&output);
                    let stats = emulate_transpose(variant, &config, width, &src, &mut dst)?;
                    log::trace!("{}: {} kernel done {:?}", device, variant, stats);
                    state.kernel_stats.push(stats);
                }
                QueuedOp::PeerCopy { dst, src, len } => {
                    let src = lock(&src)[..len].to_vec();
                    let mut dst = lock(&dst);
                    dst[..len].copy_from_slice(&src);
                    if len > 0 && self.has_fault(SimFault::CorruptPeerCopy) {
                        dst[0] += 1.0;
                    }
                }
            }
        }
        Ok(drained)
    }
}

impl AcceleratorRuntime for SimulatedRuntime {
    type Buffer = SimBuffer;

    fn name(&self) -> &'static str {
        "sim"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(self.device_count)
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool> {
        self.check_device("cuDeviceCanAccessPeer", device)?;
        self.check_device("cuDeviceCanAccessPeer", peer)?;
        Ok(self.peer_access.contains(&(device.0, peer.0)))
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()> {
        self.check_device("cuCtxEnablePeerAccess", device)?;
        self.check_device("cuCtxEnablePeerAccess", peer)?;
        if !self.peer_access.contains(&(device.0, peer.0)) {
            return Err(P2pError::runtime(
                "cuCtxEnablePeerAccess",
                "CUDA_ERROR_PEER_ACCESS_UNSUPPORTED",
            ));
        }

        let mut state = lock(&self.state);
        if !state.enabled.insert((device.0, peer.0)) {
            return Err(P2pError::link_state(device, peer, "peer access already enabled"));
        }
        state.events.push(SimEvent::EnablePeer { device, peer });
        Ok(())
    }

    fn disable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()> {
        self.check_device("cuCtxDisablePeerAccess", device)?;
        self.check_device("cuCtxDisablePeerAccess", peer)?;

        let mut state = lock(&self.state);
        if !state.enabled.remove(&(device.0, peer.0)) {
            return Err(P2pError::link_state(device, peer, "peer access not enabled"));
        }
        state.events.push(SimEvent::DisablePeer { device, peer });
        Ok(())
    }

    fn alloc(&self, device: DeviceId, len: usize) -> Result<SimBuffer> {
        self.check_device("cuMemAlloc", device)?;
        let mut state = lock(&self.state);
        let buffer = self.new_buffer(&mut state, device, vec![0.0; len])?;
        state.events.push(SimEvent::Alloc { device, len });
        Ok(buffer)
    }

    fn upload(&self, device: DeviceId, host: &[f32]) -> Result<SimBuffer> {
        self.check_device("cuMemcpyHtoD", device)?;
        let mut state = lock(&self.state);
        let buffer = self.new_buffer(&mut state, device, host.to_vec())?;
        state.events.push(SimEvent::Upload {
            device,
            len: host.len(),
        });
        Ok(buffer)
    }

    fn download(&self, buffer: &SimBuffer) -> Result<Vec<f32>> {
        let mut state = lock(&self.state);
        self.drain(&mut state, buffer.device)?;
        state.events.push(SimEvent::Download {
            device: buffer.device,
            len: buffer.len,
        });
        Ok(lock(&buffer.data).clone())
    }

    fn write(&self, dst: &mut SimBuffer, host: &[f32]) -> Result<()> {
        if host.len() > dst.len {
            return Err(P2pError::transfer(format!(
                "{} host elements do not fit a {}-element buffer on {}",
                host.len(),
                dst.len,
                dst.device
            )));
        }
        let mut state = lock(&self.state);
        self.drain(&mut state, dst.device)?;
        lock(&dst.data)[..host.len()].copy_from_slice(host);
        state.events.push(SimEvent::Upload {
            device: dst.device,
            len: host.len(),
        });
        Ok(())
    }

    fn copy_peer(&self, dst: &mut SimBuffer, src: &SimBuffer, size_bytes: usize) -> Result<()> {
        let elem = std::mem::size_of::<f32>();
        if size_bytes % elem != 0 || size_bytes > dst.size_bytes() || size_bytes > src.size_bytes() {
            return Err(P2pError::runtime("cuMemcpyPeerAsync", "CUDA_ERROR_INVALID_VALUE"));
        }

        let mut state = lock(&self.state);
        if !state.enabled.contains(&(dst.device.0, src.device.0)) {
            return Err(P2pError::runtime(
                "cuMemcpyPeerAsync",
                "CUDA_ERROR_PEER_ACCESS_NOT_ENABLED",
            ));
        }
        if !state.queues[src.device.0].is_empty() {
            return Err(P2pError::transfer(format!(
                "{} still has queued work; synchronize it before copying out of it",
                src.device
            )));
        }

        state.queues[dst.device.0].push_back(QueuedOp::PeerCopy {
            dst: Arc::clone(&dst.data),
            src: Arc::clone(&src.data),
            len: size_bytes / elem,
        });
        state.events.push(SimEvent::PeerCopy {
            dst: dst.device,
            src: src.device,
            bytes: size_bytes,
        });
        Ok(())
    }

    fn launch_transpose(
        &self,
        device: DeviceId,
        variant: KernelVariant,
        config: &KernelLaunchConfig,
        input: &SimBuffer,
        output: &mut SimBuffer,
        width: usize,
    ) -> Result<()> {
        self.check_device("cuLaunchKernel", device)?;
        if self.has_fault(SimFault::FailLaunchOn(device)) {
            return Err(P2pError::runtime("cuLaunchKernel", "CUDA_ERROR_LAUNCH_FAILED"));
        }

        let mut state = lock(&self.state);
        state.queues[device.0].push_back(QueuedOp::Launch {
            variant,
            config: *config,
            width,
            input: Arc::clone(&input.data),
            output: Arc::clone(&output.data),
        });
        state.events.push(SimEvent::Launch { device, variant });
        Ok(())
    }

    fn synchronize(&self, device: DeviceId) -> Result<()> {
        self.check_device("cuCtxSynchronize", device)?;
        let mut state = lock(&self.state);
        let drained = self.drain(&mut state, device)?;
        state.events.push(SimEvent::Synchronize { device, drained });
        Ok(())
    }
}

/// Emulates one launch of the tile-transpose kernel.
///
/// Each block gets its own scratch buffer: `STATIC_WIDTH²` elements for the
/// static variant, `shared_mem_bytes / 4` for the dynamic one. Every thread
/// of a block reaches the barrier between the staging and write phases,
/// including threads outside the matrix, which touch no memory.
pub fn emulate_transpose(
    variant: KernelVariant,
    config: &KernelLaunchConfig,
    width: usize,
    input: &[f32],
    output: &mut [f32],
) -> Result<KernelStats> {
    let cells = width * width;
    if input.len() < cells || output.len() < cells {
        return Err(P2pError::runtime("cuLaunchKernel", "CUDA_ERROR_ILLEGAL_ADDRESS"));
    }

    let scratch_len = match variant {
        KernelVariant::Static => STATIC_WIDTH * STATIC_WIDTH,
        KernelVariant::Dynamic => config.shared_mem_bytes as usize / std::mem::size_of::<f32>(),
    };

    let (grid_x, grid_y, _) = config.grid_dim;
    let (block_x, block_y, _) = config.block_dim;
    let (block_x, block_y) = (block_x as usize, block_y as usize);
    let threads_per_block = block_x * block_y;

    let mut stats = KernelStats::default();

    for by in 0..grid_y as usize {
        for bx in 0..grid_x as usize {
            stats.blocks += 1;
            let mut scratch = vec![0.0f32; scratch_len];
            let mut arrivals = 0;

            // Stage: scratch[y*w + x] = in[x*w + y]
            for ty in 0..block_y {
                for tx in 0..block_x {
                    let x = bx * block_x + tx;
                    let y = by * block_y + ty;
                    if x < width && y < width {
                        let s = y * width + x;
                        if s >= scratch_len {
                            return Err(P2pError::runtime(
                                "cuLaunchKernel",
                                "CUDA_ERROR_ILLEGAL_ADDRESS",
                            ));
                        }
                        scratch[s] = input[x * width + y];
                        stats.global_reads += 1;
                    } else {
                        stats.idle_threads += 1;
                    }
                    arrivals += 1;
                }
            }

            // __syncthreads(): the whole block must arrive.
            if arrivals != threads_per_block {
                return Err(P2pError::runtime("cuLaunchKernel", "barrier divergence"));
            }
            stats.barrier_arrivals += arrivals;

            // Write: out[y*w + x] = scratch[y*w + x]
            for ty in 0..block_y {
                for tx in 0..block_x {
                    let x = bx * block_x + tx;
                    let y = by * block_y + ty;
                    if x < width && y < width {
                        let s = y * width + x;
                        output[s] = scratch[s];
                        stats.global_writes += 1;
                    }
                }
            }
        }
    }

    Ok(stats)
}
