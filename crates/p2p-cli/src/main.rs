//! p2p-transpose CLI entry point.
//!
//! Runs the two-device transpose round trip once and maps the outcome to an
//! exit status:
//! - 0: completed (mismatches included under policy `report`) or skipped
//!   because the host lacks a peer-capable device pair
//! - 1: aborted on a resource, topology or runtime-call failure
//! - 2: validation mismatch under policy `fail`

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use p2p_core::P2pError;
use p2p_gpu::{AcceleratorRuntime, SimulatedRuntime};
use p2p_pipeline::{MismatchPolicy, PipelineConfig, PipelineOutcome, TransposePipeline};
use std::path::PathBuf;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// CUDA when built with the `cuda` feature and a driver is present, else simulated
    Auto,
    Cuda,
    Sim,
}

#[derive(Parser, Debug)]
#[command(name = "p2p-transpose")]
#[command(version = VERSION)]
#[command(about = "Peer-to-peer matrix transpose across two accelerator devices", long_about = None)]
struct Args {
    /// TOML configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Matrix width
    #[arg(long)]
    width: Option<usize>,

    /// Thread-block edge length
    #[arg(long)]
    block_size: Option<usize>,

    /// Round-trip comparison tolerance
    #[arg(long)]
    epsilon: Option<f32>,

    /// Exit with status 2 when the round trip does not match
    #[arg(long)]
    fail_on_mismatch: bool,

    /// Copy through host memory when no peer-capable pair exists
    #[arg(long)]
    staged_fallback: bool,

    /// Accelerator backend
    #[arg(long, value_enum, default_value = "auto")]
    backend: Backend,

    /// Device count for the simulated backend
    #[arg(long, default_value = "2")]
    sim_devices: usize,

    /// Simulated devices have no peer access to each other
    #[arg(long)]
    sim_no_peer: bool,

    /// Write a JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(width) = args.width {
        config.width = width;
    }
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(epsilon) = args.epsilon {
        config.epsilon = epsilon;
    }
    if args.fail_on_mismatch {
        config.mismatch_policy = MismatchPolicy::Fail;
    }
    if args.staged_fallback {
        config.staged_fallback = true;
    }

    config.validate()?;
    Ok(config)
}

fn simulated(args: &Args) -> SimulatedRuntime {
    if args.sim_no_peer {
        SimulatedRuntime::isolated(args.sim_devices)
    } else {
        SimulatedRuntime::fully_connected(args.sim_devices)
    }
}

fn run_pipeline<R: AcceleratorRuntime>(
    runtime: &R,
    config: PipelineConfig,
    report_path: Option<&PathBuf>,
) -> Result<i32> {
    log::info!("Backend: {}", runtime.name());
    let mut pipeline = TransposePipeline::new(runtime, config)?;

    let outcome = pipeline.run()?;
    match &outcome {
        PipelineOutcome::Completed(report) => {
            println!(
                "Transpose round trip {} -> {} ({:?}): {} mismatch(es) in {} elements",
                report.device_a,
                report.device_b,
                report.transfer,
                report.validation.error_count,
                report.validation.compared
            );
            if let Some(path) = report_path {
                report
                    .write_json(path)
                    .with_context(|| format!("Failed to write report {}", path.display()))?;
            }
        }
        PipelineOutcome::Skipped(reason) => {
            println!("Skipped: {}", reason);
        }
    }

    Ok(outcome.exit_code())
}

fn run(args: &Args) -> Result<i32> {
    let config = load_config(args)?;

    match args.backend {
        Backend::Sim => run_pipeline(&simulated(args), config, args.report.as_ref()),
        Backend::Cuda => run_cuda(config, args.report.as_ref()),
        Backend::Auto => {
            #[cfg(feature = "cuda")]
            {
                match p2p_gpu::CudaRuntime::new() {
                    Ok(runtime) => return run_pipeline(&runtime, config, args.report.as_ref()),
                    Err(e) => log::warn!("CUDA unavailable ({}); using simulated backend", e),
                }
            }
            run_pipeline(&simulated(args), config, args.report.as_ref())
        }
    }
}

#[cfg(feature = "cuda")]
fn run_cuda(config: PipelineConfig, report_path: Option<&PathBuf>) -> Result<i32> {
    let runtime = p2p_gpu::CudaRuntime::new()?;
    run_pipeline(&runtime, config, report_path)
}

#[cfg(not(feature = "cuda"))]
fn run_cuda(_config: PipelineConfig, _report_path: Option<&PathBuf>) -> Result<i32> {
    anyhow::bail!("CUDA backend requested but p2p-transpose was built without the `cuda` feature")
}

fn main() {
    let args = Args::parse();

    // Initialize logger
    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    log::info!("p2p-transpose {} - Starting", VERSION);

    let code = match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if let Some(p2p) = e.downcast_ref::<P2pError>() {
                log::error!("Run aborted ({:?} error)", p2p.class());
                eprintln!("{}", p2p.user_message());
            }
            1
        }
    };

    std::process::exit(code);
}
