//! Core types shared by the GPU layer and the pipeline.

use crate::errors::{P2pError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Matrix width the statically-sized kernel's scratch buffer is built for.
///
/// Must match `STATIC_WIDTH` in `kernels/transpose.cu`. Narrower matrices fit;
/// wider ones need the dynamic variant.
pub const STATIC_WIDTH: usize = 32;

/// Hardware limit on threads per block.
pub const MAX_THREADS_PER_BLOCK: usize = 1024;

/// Dynamic shared memory available to a block without opt-in attributes.
pub const MAX_DYNAMIC_SHARED_BYTES: usize = 48 * 1024;

/// Accelerator device ordinal.
///
/// Devices are a process-wide resource; the pipeline only ever addresses
/// them by ordinal and never owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

impl DeviceId {
    pub fn ordinal(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpu{}", self.0)
    }
}

/// Pair of devices with direct access from `current` into `peer`'s memory.
///
/// Produced by topology discovery with `peer < current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePair {
    /// Device granted access; runs the second kernel.
    pub current: DeviceId,
    /// Device whose memory is read; runs the first kernel.
    pub peer: DeviceId,
}

impl fmt::Display for DevicePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.current, self.peer)
    }
}

/// Square row-major matrix of `f32` held in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostMatrix {
    width: usize,
    data: Vec<f32>,
}

impl HostMatrix {
    /// Wraps `data` as a `width x width` matrix.
    pub fn from_vec(width: usize, data: Vec<f32>) -> Result<Self> {
        if width == 0 {
            return Err(P2pError::config("matrix width must be > 0"));
        }
        if data.len() != width * width {
            return Err(P2pError::config(format!(
                "matrix data length {} does not match width {} ({} elements)",
                data.len(),
                width,
                width * width
            )));
        }
        Ok(Self { width, data })
    }

    /// Sequential values `1..=width²` in row-major order.
    pub fn sequential(width: usize) -> Self {
        let data = (1..=width * width).map(|v| v as f32).collect();
        Self { width, data }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Host-side reference transpose.
    pub fn transposed(&self) -> Self {
        let w = self.width;
        let mut data = vec![0.0; w * w];
        for row in 0..w {
            for col in 0..w {
                data[col * w + row] = self.data[row * w + col];
            }
        }
        Self { width: w, data }
    }
}

/// Scratch-memory provisioning of the tile-transpose kernel.
///
/// Both variants run the same algorithm; they differ only in how the
/// block-shared scratch buffer is sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelVariant {
    /// Scratch sized at build time for [`STATIC_WIDTH`].
    Static,
    /// Scratch sized from the runtime width and passed with the launch.
    Dynamic,
}

impl KernelVariant {
    /// Kernel entry point in `transpose.cu`.
    pub fn entry_point(self) -> &'static str {
        match self {
            KernelVariant::Static => "static_shared_transpose",
            KernelVariant::Dynamic => "dynamic_shared_transpose",
        }
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelVariant::Static => write!(f, "static"),
            KernelVariant::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Launch geometry for one kernel dispatch. Built fresh per launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelLaunchConfig {
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    /// Dynamic shared memory in bytes (0 for the static variant).
    pub shared_mem_bytes: u32,
}

impl KernelLaunchConfig {
    /// Computes the launch geometry for a `width x width` transpose.
    pub fn for_variant(variant: KernelVariant, width: usize, block_size: usize) -> Result<Self> {
        if width == 0 {
            return Err(P2pError::launch("width must be > 0"));
        }
        if block_size == 0 {
            return Err(P2pError::launch("block_size must be > 0"));
        }
        if block_size * block_size > MAX_THREADS_PER_BLOCK {
            return Err(P2pError::launch(format!(
                "block_size {} gives {} threads per block (max {})",
                block_size,
                block_size * block_size,
                MAX_THREADS_PER_BLOCK
            )));
        }

        let blocks = width.div_ceil(block_size) as u32;
        let shared_mem_bytes = match variant {
            KernelVariant::Static => 0,
            KernelVariant::Dynamic => {
                let bytes = width * width * std::mem::size_of::<f32>();
                if bytes > MAX_DYNAMIC_SHARED_BYTES {
                    return Err(P2pError::launch(format!(
                        "width {} needs {} bytes of shared scratch (max {})",
                        width, bytes, MAX_DYNAMIC_SHARED_BYTES
                    )));
                }
                bytes as u32
            }
        };

        Ok(Self {
            grid_dim: (blocks, blocks, 1),
            block_dim: (block_size as u32, block_size as u32, 1),
            shared_mem_bytes,
        })
    }

    pub fn threads_per_block(&self) -> usize {
        (self.block_dim.0 * self.block_dim.1 * self.block_dim.2) as usize
    }

    pub fn total_blocks(&self) -> usize {
        (self.grid_dim.0 * self.grid_dim.1 * self.grid_dim.2) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_matrix() {
        let m = HostMatrix::sequential(32);
        assert_eq!(m.len(), 1024);
        assert_eq!(m.as_slice()[0], 1.0);
        assert_eq!(m.as_slice()[1023], 1024.0);
        assert_eq!(m.size_bytes(), 4096);
    }

    #[test]
    fn test_host_transpose() {
        let m = HostMatrix::from_vec(2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(m.transposed().as_slice(), &[1.0, 3.0, 2.0, 4.0]);
        assert_eq!(m.transposed().transposed(), m);
    }

    #[test]
    fn test_from_vec_rejects_bad_length() {
        assert!(HostMatrix::from_vec(3, vec![0.0; 8]).is_err());
        assert!(HostMatrix::from_vec(0, vec![]).is_err());
    }

    #[test]
    fn test_launch_config_reference_geometry() {
        let cfg = KernelLaunchConfig::for_variant(KernelVariant::Static, 32, 4).unwrap();
        assert_eq!(cfg.grid_dim, (8, 8, 1));
        assert_eq!(cfg.block_dim, (4, 4, 1));
        assert_eq!(cfg.shared_mem_bytes, 0);

        let cfg = KernelLaunchConfig::for_variant(KernelVariant::Dynamic, 32, 4).unwrap();
        assert_eq!(cfg.shared_mem_bytes, 32 * 32 * 4);
    }

    #[test]
    fn test_launch_config_rounds_grid_up() {
        let cfg = KernelLaunchConfig::for_variant(KernelVariant::Dynamic, 33, 4).unwrap();
        assert_eq!(cfg.grid_dim, (9, 9, 1));
        assert_eq!(cfg.total_blocks(), 81);
        assert_eq!(cfg.threads_per_block(), 16);
    }

    #[test]
    fn test_launch_config_rejects_oversized_blocks() {
        assert!(KernelLaunchConfig::for_variant(KernelVariant::Dynamic, 64, 33).is_err());
        assert!(KernelLaunchConfig::for_variant(KernelVariant::Dynamic, 64, 0).is_err());
        assert!(KernelLaunchConfig::for_variant(KernelVariant::Dynamic, 0, 4).is_err());
    }

    #[test]
    fn test_launch_config_rejects_oversized_scratch() {
        assert!(KernelLaunchConfig::for_variant(KernelVariant::Dynamic, 110, 8).is_ok());
        assert!(KernelLaunchConfig::for_variant(KernelVariant::Dynamic, 111, 8).is_err());
        // Static scratch is not part of the launch.
        assert!(KernelLaunchConfig::for_variant(KernelVariant::Static, 111, 8).is_ok());
    }
}
