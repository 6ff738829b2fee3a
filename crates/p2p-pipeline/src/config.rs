//! Pipeline configuration and validation.

use p2p_core::{P2pError, Result, DEFAULT_EPSILON, STATIC_WIDTH};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest block edge: `32 x 32 = 1024` threads per block.
pub const MAX_BLOCK_SIZE: usize = 32;

/// What a validation mismatch does to the process outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Log the mismatch count; the run still counts as successful.
    #[default]
    Report,
    /// Treat any mismatch as a failed run (distinct exit status).
    Fail,
}

/// Pipeline configuration. Every key is optional in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Matrix edge length
    #[serde(default = "default_width")]
    pub width: usize,

    /// Thread-block edge length
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Absolute tolerance for the round-trip comparison
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,

    #[serde(default)]
    pub mismatch_policy: MismatchPolicy,

    /// Copy through host memory when no peer-capable pair exists
    #[serde(default = "default_false")]
    pub staged_fallback: bool,

    /// Also check the device-A intermediate against a host transpose
    #[serde(default = "default_false")]
    pub verify_intermediate: bool,
}

fn default_width() -> usize {
    STATIC_WIDTH
}

fn default_block_size() -> usize {
    4
}

fn default_epsilon() -> f32 {
    DEFAULT_EPSILON
}

fn default_false() -> bool {
    false
}

impl PipelineConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validates the configuration.
    ///
    /// The first kernel uses build-time scratch sized for [`STATIC_WIDTH`],
    /// so the width is capped there for both kernels.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.width > STATIC_WIDTH {
            return Err(P2pError::config(format!(
                "width ({}) must be in 1..={}",
                self.width, STATIC_WIDTH
            )));
        }

        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(P2pError::config(format!(
                "block_size ({}) must be in 1..={}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }

        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(P2pError::config(format!(
                "epsilon ({}) must be finite and non-negative",
                self.epsilon
            )));
        }

        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            block_size: default_block_size(),
            epsilon: default_epsilon(),
            mismatch_policy: MismatchPolicy::default(),
            staged_fallback: false,
            verify_intermediate: false,
        }
    }
}

/// Builder for PipelineConfig.
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn width(mut self, width: usize) -> Self {
        self.config.width = width;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.config.block_size = block_size;
        self
    }

    pub fn epsilon(mut self, epsilon: f32) -> Self {
        self.config.epsilon = epsilon;
        self
    }

    pub fn mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.config.mismatch_policy = policy;
        self
    }

    /// Allows the host-staged copy when no peer pair exists.
    pub fn staged_fallback(mut self, enable: bool) -> Self {
        self.config.staged_fallback = enable;
        self
    }

    pub fn verify_intermediate(mut self, enable: bool) -> Self {
        self.config.verify_intermediate = enable;
        self
    }

    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
