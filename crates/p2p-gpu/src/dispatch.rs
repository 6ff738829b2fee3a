//! Tile-transpose kernel dispatch.
//!
//! One kernel algorithm, two scratch provisioning variants
//! ([`KernelVariant`]). The launch geometry is computed fresh for every
//! dispatch: `ceil(width / block_size)` blocks per dimension of
//! `block_size x block_size` threads.

use crate::runtime::{AcceleratorRuntime, DeviceBuffer};
use p2p_core::{DeviceId, KernelLaunchConfig, KernelVariant, P2pError, Result, STATIC_WIDTH};

/// Validates and queues one transpose of `input` into `output` on `device`.
///
/// Returns the launch configuration used. The launch is asynchronous;
/// synchronize `device` before reading `output` from another device.
///
/// # Errors
/// - `InvalidLaunch` for a zero or oversized geometry, buffers on another
///   device or shorter than `width²`, or a static launch wider than
///   [`STATIC_WIDTH`]
/// - whatever the runtime reports for the launch itself
pub fn launch_transpose<R: AcceleratorRuntime>(
    runtime: &R,
    device: DeviceId,
    variant: KernelVariant,
    input: &R::Buffer,
    output: &mut R::Buffer,
    width: usize,
    block_size: usize,
) -> Result<KernelLaunchConfig> {
    let config = KernelLaunchConfig::for_variant(variant, width, block_size)?;

    if variant == KernelVariant::Static && width > STATIC_WIDTH {
        return Err(P2pError::launch(format!(
            "static kernel scratch holds {}x{}; width {} needs the dynamic variant",
            STATIC_WIDTH, STATIC_WIDTH, width
        )));
    }
    for (role, buffer_device, len) in [
        ("input", input.device(), input.len()),
        ("output", output.device(), output.len()),
    ] {
        if buffer_device != device {
            return Err(P2pError::launch(format!(
                "{} buffer lives on {}, launch targets {}",
                role, buffer_device, device
            )));
        }
        if len < width * width {
            return Err(P2pError::launch(format!(
                "{} buffer holds {} elements, width {} needs {}",
                role,
                len,
                width,
                width * width
            )));
        }
    }

    log::debug!(
        "[DISPATCH] {} {} kernel: grid={:?} block={:?} shared={}B width={}",
        device,
        variant,
        config.grid_dim,
        config.block_dim,
        config.shared_mem_bytes,
        width
    );

    runtime.launch_transpose(device, variant, &config, input, output, width)?;
    Ok(config)
}
