//! Offload engine benchmarks.
//!
//! Compares the one-shot and handle call styles for blocking reads and
//! writes, and measures pipelined submission through a handle at several
//! queue depths and thread counts. Base settings are read through
//! `nvswap_bench::bench_config`.

use std::hint::black_box;
use std::path::Path;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use nvswap::{CallStyle, Engine, EngineHandle};
use nvswap_config::AioConfig;
use nvswap_io::BufferManager;
use tempfile::TempDir;

const SIZES: [usize; 3] = [64 * 1024, 1024 * 1024, 8 * 1024 * 1024];

fn config() -> AioConfig {
    nvswap_bench::bench_config().expect("invalid benchmark configuration")
}

fn scratch() -> TempDir {
    tempfile::tempdir().expect("failed to create temp dir")
}

fn seed(path: &Path, len: usize) {
    std::fs::write(path, vec![0xa5u8; len]).expect("failed to seed file");
}

// ============================================================================
// Call style comparison
// ============================================================================

fn bench_call_styles(c: &mut Criterion) {
    let dir = scratch();
    let manager = BufferManager::default();

    for (name, read) in [("write", false), ("read", true)] {
        let mut group = c.benchmark_group(format!("call_style_{name}"));
        group.sample_size(20);

        for size in SIZES {
            let path = dir.path().join(format!("style-{size}.swp"));
            seed(&path, size);
            let buffer = manager
                .allocate(size, config().alignment)
                .expect("allocation failed");
            group.throughput(Throughput::Bytes(size as u64));

            for style in [CallStyle::OneShot, CallStyle::Handle] {
                let engine = Engine::new(config(), style).expect("engine");
                group.bench_with_input(BenchmarkId::new(style.to_string(), size), &size, |b, &size| {
                    b.iter(|| {
                        let done = if read {
                            engine.read(&path, &buffer, 0, size)
                        } else {
                            engine.write(&path, &buffer, 0, size)
                        };
                        black_box(done.expect("transfer failed"));
                    });
                });
                engine.close().expect("close failed");
            }
        }

        group.finish();
    }
}

// ============================================================================
// Pipelined submission
// ============================================================================

fn bench_pipelined_writes(c: &mut Criterion) {
    const OPS: usize = 32;
    const SIZE: usize = 256 * 1024;

    let dir = scratch();
    let mut group = c.benchmark_group("pipelined_write");
    group.sample_size(20);
    group.throughput(Throughput::Bytes((OPS * SIZE) as u64));

    for (queue_depth, threads) in [(1, 1), (8, 1), (8, 4), (32, 4)] {
        let handle = EngineHandle::start(AioConfig {
            queue_depth,
            thread_count: threads,
            ..config()
        })
        .expect("engine");
        let path = dir.path().join(format!("pipe-{queue_depth}-{threads}.swp"));
        let buffers: Vec<_> = (0..OPS)
            .map(|_| handle.new_buffer(SIZE).expect("allocation failed"))
            .collect();

        group.bench_function(BenchmarkId::new("qd_threads", format!("{queue_depth}x{threads}")), |b| {
            b.iter(|| {
                for (i, buffer) in buffers.iter().enumerate() {
                    let _token = handle
                        .write(&path, buffer, (i * SIZE) as u64, SIZE)
                        .expect("submit failed");
                }
                black_box(handle.wait_all().expect("drain failed"));
            });
        });
        handle.close().expect("close failed");
    }

    group.finish();
}

criterion_group!(benches, bench_call_styles, bench_pipelined_writes);
criterion_main!(benches);
