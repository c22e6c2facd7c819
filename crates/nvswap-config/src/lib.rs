//! Configuration management for nvswap
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (NVSWAP_* prefix, highest precedence)
//! 2. nvswap.local.toml (gitignored, local overrides)
//! 3. nvswap.toml (project config)
//! 4. ~/.config/nvswap/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The engine itself only ever sees an [`AioConfig`]: it is captured once
//! when a handle is opened and never changes afterwards.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Smallest accepted alignment (one 512-byte sector).
pub const MIN_ALIGNMENT: usize = 512;

/// Upper bound on worker threads per engine.
pub const MAX_THREADS: usize = 1024;

/// Main nvswap configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NvswapConfig {
    pub aio: AioConfig,
}

/// Engine settings captured at handle construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AioConfig {
    /// Transfer chunk size in bytes; every system call moves at most this much.
    pub block_size: usize,
    /// Buffer and offset alignment for unbuffered I/O.
    pub alignment: usize,
    /// Operations in flight at once per worker thread.
    pub queue_depth: usize,
    /// Number of worker threads.
    pub thread_count: usize,
    /// Hand each operation to the device with its own submit call instead
    /// of one call per batch.
    pub single_submit: bool,
    /// Keep up to `queue_depth` operations in flight per thread, refilling
    /// as each completes and publishing its completion at once. Without it
    /// a worker runs one batch to the end before taking the next.
    pub overlap_events: bool,
    /// Route transfers through the GPU-direct storage backend.
    pub use_gds: bool,
    /// Submit transfers through the Linux io_uring interface. The engine
    /// refuses to start where the kernel does not provide it.
    pub io_uring: bool,
    /// Request O_DIRECT when buffer, offset, and length are aligned.
    pub direct_io: bool,
    /// Lock handle-allocated buffers in memory.
    pub pin_buffers: bool,
    /// Re-read every transferred range and compare it with the buffer.
    pub validate: bool,
    /// Retries for short transfers before an operation fails.
    pub max_retries: u32,
    /// How long a submission may wait for queue space; unset waits forever.
    pub submit_timeout_ms: Option<u64>,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024,
            alignment: 4096,
            queue_depth: 8,
            thread_count: 1,
            single_submit: false,
            overlap_events: true,
            use_gds: false,
            io_uring: false,
            direct_io: true,
            pin_buffers: false,
            validate: false,
            max_retries: 3,
            submit_timeout_ms: None,
        }
    }
}

impl AioConfig {
    /// The same settings reduced to a single worker with a single slot, as
    /// used by the one-shot submission path.
    pub fn one_shot(&self) -> Self {
        Self {
            queue_depth: 1,
            thread_count: 1,
            single_submit: true,
            ..self.clone()
        }
    }

    /// Maximum outstanding (queued or executing) operations per handle.
    pub fn capacity(&self) -> usize {
        self.queue_depth.saturating_mul(self.thread_count)
    }

    /// Maximum operations handed to the device in one submit call.
    pub fn batch_size(&self) -> usize {
        if self.single_submit { 1 } else { self.queue_depth }
    }

    /// Maximum operations a worker keeps in flight.
    pub fn in_flight_per_thread(&self) -> usize {
        if self.overlap_events {
            self.queue_depth
        } else {
            self.batch_size()
        }
    }

    /// Submission timeout as a `Duration`.
    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }

    /// Checks the settings for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alignment < MIN_ALIGNMENT || !self.alignment.is_power_of_two() {
            return Err(ConfigError::ValidationError(format!(
                "alignment {} must be a power of two >= {MIN_ALIGNMENT}",
                self.alignment
            )));
        }
        if self.block_size == 0 || self.block_size % self.alignment != 0 {
            return Err(ConfigError::ValidationError(format!(
                "block_size {} must be a non-zero multiple of alignment {}",
                self.block_size, self.alignment
            )));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        if self.use_gds && self.io_uring {
            return Err(ConfigError::ValidationError(
                "use_gds and io_uring select different backends; enable one".to_string(),
            ));
        }
        if self.thread_count == 0 || self.thread_count > MAX_THREADS {
            return Err(ConfigError::ValidationError(format!(
                "thread_count {} must be between 1 and {MAX_THREADS}",
                self.thread_count
            )));
        }
        Ok(())
    }
}

impl NvswapConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
