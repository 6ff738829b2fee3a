//! Transpose kernel integration tests on the simulated backend.
//!
//! Run with: cargo test -p p2p-gpu --test kernel_integration

use p2p_core::{DeviceId, HostMatrix, KernelVariant, STATIC_WIDTH};
use p2p_gpu::{launch_transpose, AcceleratorRuntime, SimulatedRuntime};

const DEV: DeviceId = DeviceId(0);

#[test]
fn test_transpose_twice_is_identity() {
    env_logger::builder().is_test(true).try_init().ok();

    let rt = SimulatedRuntime::fully_connected(2);
    let matrix = HostMatrix::sequential(STATIC_WIDTH);

    let input = rt.upload(DEV, matrix.as_slice()).unwrap();
    let mut once = rt.alloc(DEV, matrix.len()).unwrap();
    let mut twice = rt.alloc(DEV, matrix.len()).unwrap();

    launch_transpose(&rt, DEV, KernelVariant::Static, &input, &mut once, STATIC_WIDTH, 4).unwrap();
    launch_transpose(&rt, DEV, KernelVariant::Dynamic, &once, &mut twice, STATIC_WIDTH, 8).unwrap();

    // Same queue: no synchronize needed between the launches.
    assert_eq!(rt.download(&twice).unwrap(), matrix.as_slice());
    assert_eq!(rt.kernel_stats().len(), 2);
}

#[test]
fn test_non_multiple_width_leaves_tail_untouched() {
    env_logger::builder().is_test(true).try_init().ok();

    let rt = SimulatedRuntime::fully_connected(2);
    let width = 33;
    let cells = width * width;
    let matrix = HostMatrix::sequential(width);

    let input = rt.upload(DEV, matrix.as_slice()).unwrap();
    let mut output = rt.upload(DEV, &vec![-7.0; cells + 100]).unwrap();

    let config =
        launch_transpose(&rt, DEV, KernelVariant::Dynamic, &input, &mut output, width, 4).unwrap();
    assert_eq!(config.grid_dim, (9, 9, 1));

    let result = rt.download(&output).unwrap();
    assert_eq!(&result[..cells], matrix.transposed().as_slice());
    assert!(result[cells..].iter().all(|&v| v == -7.0));

    let stats = rt.kernel_stats()[0];
    assert_eq!(stats.blocks, 81);
    assert_eq!(stats.barrier_arrivals, 81 * 16);
    assert_eq!(stats.global_writes, cells);
    assert_eq!(stats.idle_threads, 81 * 16 - cells);
}

#[test]
fn test_every_block_size_agrees() {
    let rt = SimulatedRuntime::fully_connected(2);
    let width = 20;
    let matrix = HostMatrix::sequential(width);
    let expected = matrix.transposed();
    let input = rt.upload(DEV, matrix.as_slice()).unwrap();

    for block in 1..=32 {
        for variant in [KernelVariant::Static, KernelVariant::Dynamic] {
            let mut output = rt.alloc(DEV, matrix.len()).unwrap();
            launch_transpose(&rt, DEV, variant, &input, &mut output, width, block).unwrap();
            assert_eq!(
                rt.download(&output).unwrap(),
                expected.as_slice(),
                "{} variant, block {}",
                variant,
                block
            );
        }
    }
    assert_eq!(rt.live_buffers(), 1);
}

#[test]
fn test_single_element_matrix() {
    let rt = SimulatedRuntime::fully_connected(2);
    let input = rt.upload(DEV, &[42.0]).unwrap();
    let mut output = rt.alloc(DEV, 1).unwrap();

    launch_transpose(&rt, DEV, KernelVariant::Static, &input, &mut output, 1, 4).unwrap();
    assert_eq!(rt.download(&output).unwrap(), vec![42.0]);
}
