//! Error types for the peer-to-peer transpose pipeline.
//!
//! Every failure the pipeline can hit maps onto one [`ErrorClass`]. Only a
//! round-trip mismatch is [`ErrorClass::Validation`]; it never surfaces as a
//! `P2pError`, since the report carries it. Topology errors that
//! describe the machine (too few devices, no peer-capable pair) are
//! expected environment limitations and end the run cleanly.

use crate::types::DeviceId;
use thiserror::Error;

/// Unified error type for all pipeline operations.
#[derive(Error, Debug)]
pub enum P2pError {
    /// Fewer than two accelerator devices are installed.
    #[error("Insufficient devices: found {found}, need at least 2")]
    InsufficientDevices { found: usize },

    /// Two or more devices exist but no pair can access each other's memory.
    #[error("No peer-capable device pair among {device_count} devices")]
    NoPeerAccess { device_count: usize },

    /// A peer operation named the same device on both ends.
    #[error("Invalid topology: peer operation on {device} targets itself")]
    InvalidTopology { device: DeviceId },

    /// Enabling an already-enabled link, or disabling one that is not enabled.
    #[error("Peer link {current} -> {peer}: {message}")]
    PeerLinkState {
        current: DeviceId,
        peer: DeviceId,
        message: String,
    },

    /// Allocation or device enumeration failure.
    #[error("Resource error: {0}")]
    Resource(String),

    /// An accelerator runtime call reported failure.
    #[error("Runtime call {call} failed: {code}")]
    RuntimeCall { call: String, code: String },

    /// Kernel launch parameters rejected before dispatch.
    #[error("Invalid launch: {0}")]
    InvalidLaunch(String),

    /// Cross-device copy parameters rejected before dispatch.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors (config and report files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML configuration parse errors
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON report serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used to decide how a failure ends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Resource,
    Topology,
    RuntimeCall,
    /// Rejected parameters, configuration or I/O. Fatal.
    Precondition,
    /// Round-trip mismatch. Non-fatal.
    Validation,
}

impl P2pError {
    /// Creates a runtime-call error carrying the backend's failure code.
    pub fn runtime(call: impl Into<String>, code: impl std::fmt::Display) -> Self {
        P2pError::RuntimeCall {
            call: call.into(),
            code: code.to_string(),
        }
    }

    /// Creates a resource error.
    pub fn resource(message: impl Into<String>) -> Self {
        P2pError::Resource(message.into())
    }

    /// Creates a launch validation error.
    pub fn launch(message: impl Into<String>) -> Self {
        P2pError::InvalidLaunch(message.into())
    }

    /// Creates a transfer validation error.
    pub fn transfer(message: impl Into<String>) -> Self {
        P2pError::Transfer(message.into())
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        P2pError::Config(message.into())
    }

    /// Creates a peer-link precondition violation.
    pub fn link_state(current: DeviceId, peer: DeviceId, message: impl Into<String>) -> Self {
        P2pError::PeerLinkState {
            current,
            peer,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            P2pError::InsufficientDevices { .. } | P2pError::Resource(_) => ErrorClass::Resource,
            P2pError::NoPeerAccess { .. }
            | P2pError::InvalidTopology { .. }
            | P2pError::PeerLinkState { .. } => ErrorClass::Topology,
            P2pError::RuntimeCall { .. } => ErrorClass::RuntimeCall,
            P2pError::InvalidLaunch(_)
            | P2pError::Transfer(_)
            | P2pError::Config(_)
            | P2pError::Io(_)
            | P2pError::Toml(_)
            | P2pError::Serialization(_) => ErrorClass::Precondition,
        }
    }

    /// Environment limitations that end the run with a zero exit status.
    pub fn is_clean_skip(&self) -> bool {
        matches!(
            self,
            P2pError::InsufficientDevices { .. } | P2pError::NoPeerAccess { .. }
        )
    }

    /// Returns a user-friendly error message with actionable guidance.
    pub fn user_message(&self) -> String {
        match self {
            P2pError::InsufficientDevices { found } => {
                format!(
                    "The transpose pipeline needs at least two accelerator devices; found {}.\n\
                     → Run on a multi-GPU host or use `--backend sim --sim-devices 2`.",
                    found
                )
            }
            P2pError::NoPeerAccess { device_count } => {
                format!(
                    "None of the {} devices can access another's memory directly.\n\
                     → Check the interconnect topology (`nvidia-smi topo -m`).\n\
                     → Or rerun with `--staged-fallback` to copy through host memory.",
                    device_count
                )
            }
            P2pError::RuntimeCall { call, code } => {
                format!(
                    "Runtime call {} failed with {}\n\
                     → Check driver installation and device availability.",
                    call, code
                )
            }
            P2pError::Config(msg) => {
                format!(
                    "Configuration error: {}\n\
                     → Review the configuration file and command-line overrides.",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, P2pError>;
