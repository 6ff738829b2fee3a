//! CUDA backend tests.
//!
//! Require at least one NVIDIA GPU (two peer-capable GPUs for the link
//! tests), so every test is #[ignore].
//!
//! Run with: cargo test -p p2p-gpu --features cuda -- --ignored

#![cfg(feature = "cuda")]

use p2p_core::{DeviceId, HostMatrix, KernelVariant, P2pError, STATIC_WIDTH};
use p2p_gpu::{copy_peer, discover_pair, launch_transpose, AcceleratorRuntime, CudaRuntime, PeerLink};

#[test]
#[ignore] // Requires GPU hardware
fn test_cuda_transpose_both_variants() {
    env_logger::builder().is_test(true).try_init().ok();

    let rt = CudaRuntime::new().expect("CUDA driver");
    let dev = DeviceId(0);
    let matrix = HostMatrix::sequential(STATIC_WIDTH);
    let input = rt.upload(dev, matrix.as_slice()).unwrap();

    for variant in [KernelVariant::Static, KernelVariant::Dynamic] {
        let mut output = rt.alloc(dev, matrix.len()).unwrap();
        launch_transpose(&rt, dev, variant, &input, &mut output, STATIC_WIDTH, 4).unwrap();
        rt.synchronize(dev).unwrap();
        assert_eq!(rt.download(&output).unwrap(), matrix.transposed().as_slice());
    }
}

#[test]
#[ignore] // Requires two peer-capable GPUs
fn test_cuda_peer_copy() {
    env_logger::builder().is_test(true).try_init().ok();

    let rt = CudaRuntime::new().expect("CUDA driver");
    let pair = match discover_pair(&rt) {
        Ok(pair) => pair,
        Err(e @ (P2pError::InsufficientDevices { .. } | P2pError::NoPeerAccess { .. })) => {
            println!("Skipping: {}", e);
            return;
        }
        Err(e) => panic!("topology probe failed: {}", e),
    };

    let link = PeerLink::for_pair(&rt, pair).unwrap();
    let src = rt.upload(pair.peer, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let mut dst = rt.alloc(pair.current, 4).unwrap();
    rt.synchronize(pair.peer).unwrap();

    copy_peer(&rt, &link, &mut dst, &src, 16).unwrap();
    rt.synchronize(pair.current).unwrap();
    assert_eq!(rt.download(&dst).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    // Both devices stay usable after a cross-context copy.
    let after = rt.alloc(pair.current, 4).unwrap();
    rt.synchronize(pair.current).unwrap();
    drop(after);
    rt.alloc(pair.peer, 4).unwrap();
    rt.synchronize(pair.peer).unwrap();

    link.disable().unwrap();
}
