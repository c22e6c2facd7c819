//! # nvswap-bench: Throughput sweeps for the nvswap offload engine
//!
//! Runs the same read or write workload through either call style and
//! reports latency percentiles and aggregate throughput.
//!
//! Every worker thread builds its own [`Engine`], so independent workers
//! never share a queue or a pool.
//!
//! Engine settings come from [`ConfigLoader`]: `nvswap.toml` and
//! `nvswap.local.toml` in the working directory, the user config, and
//! `NVSWAP_AIO__*` variables all apply, so a sweep can be retuned without a
//! rebuild:
//!
//! ```bash
//! NVSWAP_AIO__QUEUE_DEPTH=32 NVSWAP_AIO__IO_URING=true cargo bench -p nvswap-bench
//! ```
//!
//! ## Running Benchmarks
//!
//! ```bash
//! # Criterion comparison of both call styles
//! cargo bench -p nvswap-bench
//!
//! # Save baseline for comparison
//! cargo bench -p nvswap-bench --bench offload -- --save-baseline main
//! ```

// Throughput stats use f64
#![allow(clippy::cast_precision_loss)]

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use hdrhistogram::Histogram;
use nvswap::{CallStyle, Engine};
use nvswap_config::{AioConfig, ConfigLoader};
use nvswap_io::BufferManager;

/// Tracks latency percentiles for operations.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    histogram: Histogram<u64>,
}

impl LatencyTracker {
    /// Creates a new latency tracker with 3 significant digits.
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new(3).expect("valid histogram config"),
        }
    }

    /// Records a latency measurement in nanoseconds.
    pub fn record(&mut self, latency_ns: u64) {
        self.histogram.record(latency_ns).ok();
    }

    /// Folds another tracker's samples into this one.
    pub fn merge(&mut self, other: &LatencyTracker) {
        self.histogram.add(&other.histogram).ok();
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn p50(&self) -> u64 {
        self.histogram.value_at_quantile(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.histogram.value_at_quantile(0.99)
    }

    pub fn max(&self) -> u64 {
        self.histogram.max()
    }

    pub fn mean(&self) -> f64 {
        self.histogram.mean()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// One sweep point.
#[derive(Debug, Clone)]
pub struct Workload {
    pub style: CallStyle,
    pub config: AioConfig,
    /// Bytes per operation.
    pub io_size: usize,
    /// Operations per worker.
    pub loops: usize,
    /// Independent engines running in parallel.
    pub workers: usize,
    /// Read instead of write.
    pub read: bool,
}

/// Engine settings for a benchmark run, merged from every source the default
/// [`ConfigLoader`] reads.
pub fn bench_config() -> Result<AioConfig> {
    load_config(ConfigLoader::new())
}

/// Engine settings merged by `loader`.
pub fn load_config(loader: ConfigLoader) -> Result<AioConfig> {
    let config = loader.load().context("failed to load benchmark configuration")?;
    Ok(config.aio)
}

impl Workload {
    /// Builds a workload whose engine settings come from `loader`.
    pub fn configured(
        loader: ConfigLoader,
        style: CallStyle,
        io_size: usize,
        loops: usize,
        workers: usize,
        read: bool,
    ) -> Result<Self> {
        Ok(Self {
            style,
            config: load_config(loader)?,
            io_size,
            loops,
            workers,
            read,
        })
    }

    pub fn label(&self) -> String {
        format!(
            "{}-{}-{}x{}-qd{}-t{}",
            self.style,
            if self.read { "read" } else { "write" },
            self.workers,
            self.io_size,
            self.config.queue_depth,
            self.config.thread_count,
        )
    }
}

/// Aggregate result of a workload.
#[derive(Debug)]
pub struct WorkloadReport {
    pub label: String,
    pub bytes: u64,
    pub elapsed: Duration,
    pub latency: LatencyTracker,
}

impl WorkloadReport {
    /// Aggregate throughput in GB/s (10^9 bytes).
    pub fn throughput_gbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs / 1e9
    }

    /// Exports the report as JSON for CI integration.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "workload": self.label,
            "bytes": self.bytes,
            "elapsed_ms": self.elapsed.as_millis() as u64,
            "gbps": self.throughput_gbps(),
            "ops": self.latency.count(),
            "p50_ns": self.latency.p50(),
            "p99_ns": self.latency.p99(),
            "max_ns": self.latency.max(),
            "mean_ns": self.latency.mean(),
        })
        .to_string()
    }

    pub fn print_summary(&self) {
        println!("{}:", self.label);
        println!("  throughput: {:>8.3} GB/s", self.throughput_gbps());
        println!(
            "  p50: {:>8.2} μs  p99: {:>8.2} μs  max: {:>8.2} μs",
            self.latency.p50() as f64 / 1000.0,
            self.latency.p99() as f64 / 1000.0,
            self.latency.max() as f64 / 1000.0,
        );
    }
}

/// Path of the scratch file used by worker `index` under `dir`.
pub fn worker_file(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("nvswap-bench-{index}.swp"))
}

/// Creates every worker's file at full size so reads have data to return.
pub fn prepare_files(dir: &Path, workload: &Workload) -> Result<()> {
    for index in 0..workload.workers {
        let path = worker_file(dir, index);
        std::fs::write(&path, vec![0xa5u8; workload.io_size])
            .with_context(|| format!("failed to create {}", path.display()))?;
    }
    Ok(())
}

/// Runs `workload` against files in `dir` and aggregates the results.
pub fn run_workload(dir: &Path, workload: &Workload) -> Result<WorkloadReport> {
    if workload.workers == 0 || workload.loops == 0 {
        bail!("workload needs at least one worker and one loop");
    }
    if workload.read {
        prepare_files(dir, workload)?;
    }

    let started = Instant::now();
    let results: Vec<Result<LatencyTracker>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workload.workers)
            .map(|index| {
                let path = worker_file(dir, index);
                scope.spawn(move || run_worker(&path, workload))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow::anyhow!("worker panicked"))))
            .collect()
    });
    let elapsed = started.elapsed();

    let mut latency = LatencyTracker::new();
    for result in results {
        latency.merge(&result?);
    }
    Ok(WorkloadReport {
        label: workload.label(),
        bytes: (workload.io_size * workload.loops * workload.workers) as u64,
        elapsed,
        latency,
    })
}

fn run_worker(path: &Path, workload: &Workload) -> Result<LatencyTracker> {
    let engine = Engine::new(workload.config.clone(), workload.style)?;
    let manager = BufferManager::new(workload.config.pin_buffers);
    let buffer = manager.allocate(workload.io_size, workload.config.alignment)?;
    buffer.copy_from_slice(&vec![0x5au8; workload.io_size])?;

    let mut latency = LatencyTracker::new();
    for _ in 0..workload.loops {
        let start = Instant::now();
        if workload.read {
            engine.read(path, &buffer, 0, workload.io_size)?;
        } else {
            engine.write(path, &buffer, 0, workload.io_size)?;
        }
        latency.record(start.elapsed().as_nanos() as u64);
    }
    engine.close()?;
    Ok(latency)
}
