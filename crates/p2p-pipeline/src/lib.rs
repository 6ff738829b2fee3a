//! # p2p-pipeline
//!
//! Orchestration, configuration and run reports for the peer-to-peer
//! transpose pipeline.

pub mod config;
pub mod orchestrator;
pub mod report;

pub use config::{MismatchPolicy, PipelineConfig, PipelineConfigBuilder};
pub use orchestrator::{PipelineOutcome, PipelineState, TransposePipeline};
pub use report::{RunReport, TransferPath};
