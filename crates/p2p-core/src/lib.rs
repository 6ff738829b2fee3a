//! # p2p-core
//!
//! Shared types, errors and result validation for the peer-to-peer
//! transpose pipeline.

pub mod errors;
pub mod types;
pub mod validator;

pub use errors::{ErrorClass, P2pError, Result};
pub use types::{
    DeviceId, DevicePair, HostMatrix, KernelLaunchConfig, KernelVariant, MAX_DYNAMIC_SHARED_BYTES,
    MAX_THREADS_PER_BLOCK, STATIC_WIDTH,
};
pub use validator::{compare, validate, ValidationReport, DEFAULT_EPSILON};
