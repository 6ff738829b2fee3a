//! Pipeline orchestrator: transpose on device A, hand the result to device B
//! over a peer link, transpose again on B, and check the round trip.
//!
//! ## Ordering
//!
//! A single host thread drives everything. Work is queued per device and the
//! host blocks only at two points:
//! - after the first kernel, so device A's output is complete before B reads it
//! - after the second kernel, before the result is downloaded
//!
//! The peer copy is queued on B ahead of the second kernel, so B's in-order
//! queue orders the two without a further host barrier.

use crate::config::{MismatchPolicy, PipelineConfig};
use crate::report::{RunReport, TransferPath};
use p2p_core::{
    validate, DeviceId, DevicePair, HostMatrix, KernelVariant, P2pError, Result, ValidationReport,
};
use p2p_gpu::{
    copy_peer, copy_staged, discover_pair, launch_transpose, probe_matrix, AcceleratorRuntime,
    PeerLink,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Orchestrator states, in the order a successful run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Init,
    Probed,
    PrimaryReady,
    PrimaryComputed,
    LinkEnabled,
    Transferred,
    SecondaryReady,
    SecondaryComputed,
    LinkDisabled,
    Validated,
    Done,
    Aborted,
    SkippedCleanly,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Aborted | PipelineState::SkippedCleanly
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a run that did not abort.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Completed(RunReport),
    /// The environment cannot run the pipeline (too few devices, no peer
    /// pair). Nothing was allocated.
    Skipped(String),
}

impl PipelineOutcome {
    /// Process exit status: 0 for success or a clean skip, 2 for a
    /// mismatch under [`MismatchPolicy::Fail`].
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::Completed(report)
                if !report.passed() && report.mismatch_policy == MismatchPolicy::Fail =>
            {
                2
            }
            _ => 0,
        }
    }
}

#[derive(Clone, Copy)]
enum Route {
    Peer(DevicePair),
    Staged(DevicePair),
}

/// Two-device transpose round trip over one runtime.
pub struct TransposePipeline<'r, R: AcceleratorRuntime> {
    runtime: &'r R,
    config: PipelineConfig,
    input: Option<HostMatrix>,
    history: Vec<PipelineState>,
}

impl<'r, R: AcceleratorRuntime> TransposePipeline<'r, R> {
    pub fn new(runtime: &'r R, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runtime,
            config,
            input: None,
            history: vec![PipelineState::Init],
        })
    }

    /// Replaces the default sequential input. The width must match the config.
    pub fn with_input(mut self, input: HostMatrix) -> Result<Self> {
        if input.width() != self.config.width {
            return Err(P2pError::config(format!(
                "input width {} does not match configured width {}",
                input.width(),
                self.config.width
            )));
        }
        self.input = Some(input);
        Ok(self)
    }

    /// States visited by the last run, starting with `Init`.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn state(&self) -> PipelineState {
        self.history.last().copied().unwrap_or(PipelineState::Init)
    }

    fn advance(&mut self, next: PipelineState) {
        log::debug!("[PIPELINE] {} -> {}", self.state(), next);
        self.history.push(next);
    }

    /// Runs the pipeline once.
    ///
    /// Clean skips come back as [`PipelineOutcome::Skipped`]; every other
    /// error moves the pipeline to `Aborted` and is returned. Device buffers
    /// and the peer link are released on every path.
    pub fn run(&mut self) -> Result<PipelineOutcome> {
        self.history = vec![PipelineState::Init];
        let started = Instant::now();

        match self.execute(started) {
            Ok(report) => Ok(PipelineOutcome::Completed(report)),
            Err(e) if e.is_clean_skip() => {
                log::warn!("[PIPELINE] Skipping: {}", e);
                self.advance(PipelineState::SkippedCleanly);
                Ok(PipelineOutcome::Skipped(e.to_string()))
            }
            Err(e) => {
                log::error!("[PIPELINE] Aborted in state {}: {}", self.state(), e);
                self.advance(PipelineState::Aborted);
                Err(e)
            }
        }
    }

    fn probe(&self) -> Result<Route> {
        if log::log_enabled!(log::Level::Debug) {
            match probe_matrix(self.runtime) {
                Ok(matrix) => log::debug!("[TOPOLOGY] Peer capability:\n{}", matrix),
                Err(e) => log::debug!("[TOPOLOGY] Peer capability query failed: {}", e),
            }
        }

        match discover_pair(self.runtime) {
            Ok(pair) => Ok(Route::Peer(pair)),
            Err(P2pError::NoPeerAccess { device_count }) if self.config.staged_fallback => {
                log::warn!(
                    "[PIPELINE] No peer pair among {} devices; using host-staged copy",
                    device_count
                );
                Ok(Route::Staged(DevicePair {
                    current: DeviceId(1),
                    peer: DeviceId(0),
                }))
            }
            Err(e) => Err(e),
        }
    }

    fn execute(&mut self, started: Instant) -> Result<RunReport> {
        let runtime = self.runtime;
        let width = self.config.width;
        let block_size = self.config.block_size;
        let epsilon = self.config.epsilon;

        let route = self.probe()?;
        let (pair, transfer) = match route {
            Route::Peer(pair) => (pair, TransferPath::Peer),
            Route::Staged(pair) => (pair, TransferPath::Staged),
        };
        // First kernel runs on the exposed device, second on the accessing one.
        let (device_a, device_b) = (pair.peer, pair.current);
        self.advance(PipelineState::Probed);

        let input = self
            .input
            .clone()
            .unwrap_or_else(|| HostMatrix::sequential(width));
        log::info!(
            "[PIPELINE] {}x{} matrix, block {}: {} -> {} ({:?} copy)",
            width,
            width,
            block_size,
            device_a,
            device_b,
            transfer
        );

        let d_input_a = runtime.upload(device_a, input.as_slice())?;
        let mut d_output_a = runtime.alloc(device_a, input.len())?;
        self.advance(PipelineState::PrimaryReady);

        let primary_launch = launch_transpose(
            runtime,
            device_a,
            KernelVariant::Static,
            &d_input_a,
            &mut d_output_a,
            width,
            block_size,
        )?;
        runtime.synchronize(device_a)?;
        self.advance(PipelineState::PrimaryComputed);
        drop(d_input_a);

        let intermediate = if self.config.verify_intermediate {
            let host = runtime.download(&d_output_a)?;
            let report = validate(input.transposed().as_slice(), &host, epsilon);
            log::info!(
                "[PIPELINE] Intermediate on {}: {} mismatch(es)",
                device_a,
                report.error_count
            );
            Some(report)
        } else {
            None
        };

        let mut d_input_b = runtime.alloc(device_b, input.len())?;

        let link = match route {
            Route::Peer(pair) => {
                let link = PeerLink::for_pair(runtime, pair)?;
                self.advance(PipelineState::LinkEnabled);
                Some(link)
            }
            Route::Staged(_) => None,
        };

        match &link {
            Some(link) => copy_peer(runtime, link, &mut d_input_b, &d_output_a, input.size_bytes())?,
            None => copy_staged(runtime, &mut d_input_b, &d_output_a, input.size_bytes())?,
        }
        self.advance(PipelineState::Transferred);

        let mut d_output_b = runtime.alloc(device_b, input.len())?;
        self.advance(PipelineState::SecondaryReady);

        let secondary_launch = launch_transpose(
            runtime,
            device_b,
            KernelVariant::Dynamic,
            &d_input_b,
            &mut d_output_b,
            width,
            block_size,
        )?;
        runtime.synchronize(device_b)?;
        self.advance(PipelineState::SecondaryComputed);
        drop(d_output_a);
        drop(d_input_b);

        let result = runtime.download(&d_output_b)?;
        drop(d_output_b);

        if let Some(link) = link {
            link.disable()?;
            self.advance(PipelineState::LinkDisabled);
        }

        let validation = validate(input.as_slice(), &result, epsilon);
        self.advance(PipelineState::Validated);
        log_validation(&validation, self.config.mismatch_policy);

        self.advance(PipelineState::Done);

        Ok(RunReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            backend: runtime.name().to_string(),
            device_a,
            device_b,
            transfer,
            width,
            block_size,
            primary_launch,
            secondary_launch,
            intermediate,
            validation,
            mismatch_policy: self.config.mismatch_policy,
            states: self.history.clone(),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

fn log_validation(validation: &ValidationReport, policy: MismatchPolicy) {
    if validation.passed() {
        log::info!(
            "[PIPELINE] Round trip matches input: {} elements within {}",
            validation.compared,
            validation.epsilon
        );
    } else {
        log::warn!(
            "[PIPELINE] {} of {} elements differ (max |diff| {}), policy {:?}",
            validation.error_count,
            validation.compared,
            validation.max_abs_diff,
            policy
        );
    }
}
