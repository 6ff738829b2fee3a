//! Transpose Kernel Benchmarks
//!
//! Runs on the simulated backend, so the numbers measure the emulation and
//! the dispatch overhead, not device throughput.
//!
//! Benchmarked operations:
//! - Host reference transpose
//! - Emulated kernel per variant and block size
//! - Full dispatch + synchronize round through the runtime
//!
//! ## Usage
//! ```bash
//! cargo bench -p p2p-gpu --bench transpose
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use p2p_core::{DeviceId, HostMatrix, KernelLaunchConfig, KernelVariant, STATIC_WIDTH};
use p2p_gpu::{emulate_transpose, launch_transpose, AcceleratorRuntime, SimulatedRuntime};

/// Benchmark the host reference transpose
fn bench_host_reference(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_transpose");

    for width in [16, 32, 64] {
        let matrix = HostMatrix::sequential(width);
        group.throughput(Throughput::Elements((width * width) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &matrix, |b, m| {
            b.iter(|| black_box(m.transposed()));
        });
    }

    group.finish();
}

/// Benchmark the block emulation for each variant and block size
fn bench_emulated_kernel(c: &mut Criterion) {
    let width = STATIC_WIDTH;
    let matrix = HostMatrix::sequential(width);
    let mut group = c.benchmark_group("emulated_kernel");
    group.throughput(Throughput::Elements((width * width) as u64));

    for variant in [KernelVariant::Static, KernelVariant::Dynamic] {
        for block in [4, 8, 16, 32] {
            let config = match KernelLaunchConfig::for_variant(variant, width, block) {
                Ok(config) => config,
                Err(_) => continue,
            };
            let mut output = vec![0.0f32; width * width];
            group.bench_function(BenchmarkId::new(variant.to_string(), block), |b| {
                b.iter(|| {
                    emulate_transpose(variant, &config, width, matrix.as_slice(), &mut output)
                        .map(black_box)
                })
            });
        }
    }

    group.finish();
}

/// Benchmark launch + synchronize through the runtime boundary
fn bench_dispatch_round(c: &mut Criterion) {
    let rt = SimulatedRuntime::fully_connected(2);
    let dev = DeviceId(0);
    let matrix = HostMatrix::sequential(STATIC_WIDTH);

    let (input, mut output) = match (rt.upload(dev, matrix.as_slice()), rt.alloc(dev, matrix.len())) {
        (Ok(i), Ok(o)) => (i, o),
        _ => return,
    };

    c.bench_function("dispatch_round", |b| {
        b.iter(|| {
            let launched = launch_transpose(
                &rt,
                dev,
                KernelVariant::Dynamic,
                &input,
                &mut output,
                STATIC_WIDTH,
                4,
            );
            let round = black_box(launched.and_then(|_| rt.synchronize(dev)));
            rt.clear_instrumentation();
            round
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets =
        bench_host_reference,
        bench_emulated_kernel,
        bench_dispatch_round
}
criterion_main!(benches);
