//! # p2p-gpu
//!
//! Accelerator layer for the peer-to-peer transpose pipeline.
//! The simulated backend is always available; the CUDA backend needs the
//! `cuda` feature.

pub mod runtime;
pub mod sim;

// Pair discovery and peer-access links
pub mod topology;
pub mod peer_link;

// Kernel launches and inter-device copies
pub mod dispatch;
pub mod transfer;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use runtime::{AcceleratorRuntime, DeviceBuffer};
pub use sim::{emulate_transpose, KernelStats, SimBuffer, SimEvent, SimFault, SimulatedRuntime};
pub use topology::{discover_pair, probe_matrix, PeerMatrix};
pub use peer_link::{disable_peer_access, enable_peer_access, PeerLink};
pub use dispatch::launch_transpose;
pub use transfer::{copy_peer, copy_staged};

#[cfg(feature = "cuda")]
pub use cuda::{driver_present, CudaBuffer, CudaRuntime};
