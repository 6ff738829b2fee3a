//! JSON summary of a completed run.

use crate::config::MismatchPolicy;
use crate::orchestrator::PipelineState;
use p2p_core::{DeviceId, KernelLaunchConfig, Result, ValidationReport};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How the intermediate matrix reached device B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferPath {
    /// Direct device-to-device copy over an enabled peer link
    Peer,
    /// Download from A, upload to B
    Staged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// ISO 8601 timestamp
    pub timestamp: String,

    /// Runtime backend name
    pub backend: String,

    /// Device running the static-scratch kernel
    pub device_a: DeviceId,

    /// Device running the dynamic-scratch kernel
    pub device_b: DeviceId,

    pub transfer: TransferPath,
    pub width: usize,
    pub block_size: usize,
    pub primary_launch: KernelLaunchConfig,
    pub secondary_launch: KernelLaunchConfig,

    /// Device-A output against a host transpose, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediate: Option<ValidationReport>,

    /// Final result against the original input
    pub validation: ValidationReport,

    pub mismatch_policy: MismatchPolicy,

    /// States visited, `Init` through `Done`
    pub states: Vec<PipelineState>,

    /// Wall-clock time of the run (milliseconds)
    pub elapsed_ms: f64,
}

impl RunReport {
    /// Whether the final result matched the input everywhere.
    pub fn passed(&self) -> bool {
        self.validation.passed()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the report as pretty-printed JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_json()?)?;
        log::info!("Run report written: {}", path.as_ref().display());
        Ok(())
    }
}
