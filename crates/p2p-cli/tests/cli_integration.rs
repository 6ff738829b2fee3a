//! Integration tests for the p2p-transpose binary.
//!
//! Every run uses the simulated backend; exit statuses follow the CLI's
//! 0 / 1 / 2 convention.

use std::fs;
use std::process::{Command, Output};

fn p2p_transpose(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_p2p-transpose"))
        .args(["--backend", "sim"])
        .args(args)
        .output()
        .expect("Failed to execute p2p-transpose")
}

#[test]
fn test_default_run_succeeds() {
    let output = p2p_transpose(&[]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("0 mismatch(es) in 1024 elements"), "{}", stdout);
}

#[test]
fn test_single_device_skips_cleanly() {
    let output = p2p_transpose(&["--sim-devices", "1"]);

    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Skipped"));
}

#[test]
fn test_no_peer_skips_or_falls_back() {
    let skipped = p2p_transpose(&["--sim-no-peer"]);
    assert_eq!(skipped.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&skipped.stdout).contains("Skipped"));

    let staged = p2p_transpose(&["--sim-no-peer", "--staged-fallback"]);
    assert_eq!(staged.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&staged.stdout).contains("Staged"));
}

#[test]
fn test_invalid_width_is_fatal() {
    let output = p2p_transpose(&["--width", "64"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("width (64)"));
}

#[test]
fn test_report_file() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("run.json");

    let output = p2p_transpose(&[
        "--width",
        "24",
        "--block-size",
        "8",
        "--report",
        report.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(0));

    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(value["width"], 24);
    assert_eq!(value["block_size"], 8);
    assert_eq!(value["backend"], "sim");
    assert_eq!(value["validation"]["error_count"], 0);
    assert_eq!(value["primary_launch"]["grid_dim"][0], 3);
}

#[test]
fn test_config_file_with_flag_override() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("p2p.toml");
    fs::write(&config, "width = 16\nblock_size = 2\nmismatch_policy = \"fail\"\n").unwrap();
    let report = dir.path().join("run.json");

    let output = p2p_transpose(&[
        "--config",
        config.to_str().unwrap(),
        "--block-size",
        "4",
        "--report",
        report.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(0));

    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(value["width"], 16);
    assert_eq!(value["block_size"], 4);
    assert_eq!(value["mismatch_policy"], "fail");
}

#[test]
fn test_missing_config_file_is_fatal() {
    let output = p2p_transpose(&["--config", "/nonexistent/p2p.toml"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to load config"));
}

#[cfg(not(feature = "cuda"))]
#[test]
fn test_cuda_backend_requires_feature() {
    let output = Command::new(env!("CARGO_BIN_EXE_p2p-transpose"))
        .args(["--backend", "cuda"])
        .output()
        .expect("Failed to execute p2p-transpose");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("`cuda` feature"));
}

#[cfg(feature = "cuda")]
#[test]
fn test_auto_backend_without_driver_uses_simulator() {
    let auto = Command::new(env!("CARGO_BIN_EXE_p2p-transpose"))
        .output()
        .expect("Failed to execute p2p-transpose");
    assert_eq!(
        auto.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&auto.stderr)
    );

    if p2p_gpu::driver_present() {
        return;
    }
    let cuda = Command::new(env!("CARGO_BIN_EXE_p2p-transpose"))
        .args(["--backend", "cuda"])
        .output()
        .expect("Failed to execute p2p-transpose");
    assert_eq!(cuda.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&cuda.stderr).contains("driver library not found"));
}
