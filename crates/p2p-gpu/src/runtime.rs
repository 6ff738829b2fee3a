//! Accelerator runtime boundary.
//!
//! Everything the pipeline needs from a device runtime goes through
//! [`AcceleratorRuntime`]. Every call names its device explicitly; there is
//! no ambient "current device".
//!
//! ASSUMPTIONS:
//! - Each device has one in-order queue (stream)
//! - Launches and peer copies are asynchronous: they are queued and return
//! - `synchronize` and `download` block until the device queue has drained
//! - Buffers are freed when dropped

use p2p_core::{DeviceId, KernelLaunchConfig, KernelVariant, Result};

/// Device-resident `f32` buffer owned by the host thread.
pub trait DeviceBuffer {
    /// Device holding the allocation.
    fn device(&self) -> DeviceId;

    /// Number of `f32` elements.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn size_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }
}

/// Runtime surface consumed by the pipeline.
pub trait AcceleratorRuntime {
    type Buffer: DeviceBuffer;

    /// Backend name for logs and reports.
    fn name(&self) -> &'static str;

    /// Number of installed devices.
    fn device_count(&self) -> Result<usize>;

    /// Whether `device` can map `peer`'s memory directly.
    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool>;

    /// Grants `device` direct access into `peer`'s memory.
    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()>;

    /// Revokes access granted by [`enable_peer_access`](Self::enable_peer_access).
    fn disable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()>;

    /// Allocates `len` zeroed elements on `device`.
    fn alloc(&self, device: DeviceId, len: usize) -> Result<Self::Buffer>;

    /// Allocates on `device` and copies `host` into it.
    fn upload(&self, device: DeviceId, host: &[f32]) -> Result<Self::Buffer>;

    /// Blocking copy to host after the owning device's queue drains.
    fn download(&self, buffer: &Self::Buffer) -> Result<Vec<f32>>;

    /// Queues a host-to-device copy of `host` into the front of `dst`.
    fn write(&self, dst: &mut Self::Buffer, host: &[f32]) -> Result<()>;

    /// Queues a direct copy of `size_bytes` from `src` into `dst` on
    /// `dst`'s device. Requires `dst`'s device to hold peer access into
    /// `src`'s device.
    fn copy_peer(&self, dst: &mut Self::Buffer, src: &Self::Buffer, size_bytes: usize)
        -> Result<()>;

    /// Queues one tile-transpose launch on `device`.
    fn launch_transpose(
        &self,
        device: DeviceId,
        variant: KernelVariant,
        config: &KernelLaunchConfig,
        input: &Self::Buffer,
        output: &mut Self::Buffer,
        width: usize,
    ) -> Result<()>;

    /// Blocks until all previously queued work on `device` has completed.
    fn synchronize(&self, device: DeviceId) -> Result<()>;
}
