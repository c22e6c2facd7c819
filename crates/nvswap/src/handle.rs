//! The persistent engine handle.
//!
//! # Lifecycle
//!
//! ```text
//!  new()        open()                 read()/write()
//! Created ──────────────▶ Ready ◀───────────────────▶ Submitting
//!                           │  ▲                           │
//!                  wait_all │  │ all results taken         │ wait_all
//!                           ▼  │                           ▼
//!                         Draining ◀─────────────────────────
//!                           │
//!        close()/shutdown() ▼ (from any state)
//!                         Closed
//! ```
//!
//! `Ready`, `Submitting`, and `Draining` are derived from the queue and the
//! number of threads inside `wait_all`; only `Created`, open, and `Closed`
//! are stored.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nvswap_config::AioConfig;
use nvswap_io::{
    AllocationError, BufferManager, GdsBackend, IoBackend, SharedBuffer, SyncBackend, UringBackend,
};

use crate::completion::{CompletionTracker, OpResult, PollOutcome, Token};
use crate::descriptor::{Completion, Direction, OpId, OperationDescriptor};
use crate::error::{EngineError, SubmissionError};
use crate::pool::{Shared, WorkerPool};
use crate::queue::{PushError, SubmissionQueue};
use crate::stats::{HandleStats, StatsSnapshot};
use crate::transfer::TransferSettings;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Observable lifecycle state of an [`EngineHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Configured, workers not started.
    Created,
    /// Open with nothing outstanding.
    Ready,
    /// Open with operations queued or executing.
    Submitting,
    /// A `wait_all` is in progress.
    Draining,
    /// Closed; only previously issued tokens can still be redeemed.
    Closed,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Created => "created",
            HandleState::Ready => "ready",
            HandleState::Submitting => "submitting",
            HandleState::Draining => "draining",
            HandleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Open,
    Closed,
}

struct Lifecycle {
    phase: Phase,
    drainers: usize,
    pool: Option<WorkerPool>,
}

/// A long-lived engine: a worker pool, a submission queue, and a buffer
/// manager sharing one configuration.
///
/// All methods take `&self`; a handle can be shared across threads behind an
/// `Arc`. Dropping an open handle shuts it down.
///
/// # Example
///
/// ```no_run
/// use nvswap::{AioConfig, EngineHandle};
///
/// # fn main() -> Result<(), nvswap::EngineError> {
/// let handle = EngineHandle::start(AioConfig::default())?;
/// let buffer = handle.new_buffer(1 << 20)?;
/// buffer.copy_from_slice(&[7u8; 1 << 20])?;
///
/// let token = handle.write("/tmp/swap.bin", &buffer, 0, 1 << 20)?;
/// let done = handle.wait(token)?;
/// assert_eq!(done.bytes, 1 << 20);
///
/// handle.close()?;
/// # Ok(())
/// # }
/// ```
pub struct EngineHandle {
    id: u64,
    config: AioConfig,
    shared: Arc<Shared>,
    buffers: BufferManager,
    lifecycle: Mutex<Lifecycle>,
    next_op: AtomicU64,
}

impl EngineHandle {
    /// Creates a handle over the backend selected by `config.use_gds` and
    /// `config.io_uring`.
    ///
    /// Nothing is started until [`open`](Self::open).
    pub fn new(config: AioConfig) -> Result<Self, EngineError> {
        let backend: Arc<dyn IoBackend> = if config.use_gds {
            Arc::new(GdsBackend::new())
        } else if config.io_uring {
            Arc::new(UringBackend::new())
        } else {
            Arc::new(SyncBackend::new())
        };
        Self::with_backend(config, backend)
    }

    /// Creates a handle over an explicit backend.
    pub fn with_backend(config: AioConfig, backend: Arc<dyn IoBackend>) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            handle_id: id,
            queue: SubmissionQueue::new(config.capacity()),
            tracker: CompletionTracker::new(id),
            stats: HandleStats::default(),
            backend,
            settings: TransferSettings::from(&config),
            window: config.in_flight_per_thread(),
            single_submit: config.single_submit,
            overlap_events: config.overlap_events,
        });

        Ok(Self {
            id,
            buffers: BufferManager::new(config.pin_buffers),
            config,
            shared,
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Created,
                drainers: 0,
                pool: None,
            }),
            next_op: AtomicU64::new(0),
        })
    }

    /// Creates and opens a handle in one step.
    pub fn start(config: AioConfig) -> Result<Self, EngineError> {
        let handle = Self::new(config)?;
        handle.open()?;
        Ok(handle)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks the backend and starts the worker threads.
    ///
    /// Opening an already open handle does nothing.
    pub fn open(&self) -> Result<(), EngineError> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.phase {
            Phase::Open => return Ok(()),
            Phase::Closed => return Err(EngineError::Closed),
            Phase::Created => {}
        }

        let backend = self.shared.backend.name();
        self.shared.backend.check_available().map_err(|e| {
            tracing::error!(handle = self.id, backend, error = %e, "backend unavailable");
            EngineError::Configuration(format!("{backend} backend unavailable: {e}"))
        })?;

        let pool = WorkerPool::start(&self.shared, self.config.thread_count)?;
        tracing::info!(
            handle = self.id,
            backend,
            threads = pool.len(),
            queue_depth = self.config.queue_depth,
            in_flight_per_thread = self.shared.window,
            capacity = self.shared.queue.capacity(),
            block_size = self.config.block_size,
            single_submit = self.config.single_submit,
            overlap_events = self.config.overlap_events,
            "engine opened"
        );
        lifecycle.pool = Some(pool);
        lifecycle.phase = Phase::Open;
        Ok(())
    }

    /// Returns the process-unique handle identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the configuration captured at construction.
    pub fn config(&self) -> &AioConfig {
        &self.config
    }

    /// Returns the name of the storage backend.
    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> HandleState {
        let lifecycle = self.lifecycle();
        match lifecycle.phase {
            Phase::Created => HandleState::Created,
            Phase::Closed => HandleState::Closed,
            Phase::Open if lifecycle.drainers > 0 => HandleState::Draining,
            Phase::Open if self.shared.queue.outstanding() > 0 => HandleState::Submitting,
            Phase::Open => HandleState::Ready,
        }
    }

    /// Returns the handle's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Operations queued or executing.
    pub fn outstanding(&self) -> usize {
        self.shared.queue.outstanding()
    }

    /// Operations queued and not yet taken by a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.pending()
    }

    /// Allocates a zeroed buffer aligned for direct I/O.
    ///
    /// The buffer is released when the handle closes, or earlier through
    /// [`release_buffer`](Self::release_buffer).
    pub fn new_buffer(&self, length: usize) -> Result<SharedBuffer, EngineError> {
        if self.lifecycle().phase == Phase::Closed {
            return Err(EngineError::Closed);
        }
        Ok(self.buffers.allocate(length, self.config.alignment)?)
    }

    /// Releases a buffer allocated by this handle.
    pub fn release_buffer(&self, buffer: &SharedBuffer) -> Result<(), EngineError> {
        self.buffers.release(buffer).map_err(|e| match e {
            AllocationError::InUse { buffer } => EngineError::from(SubmissionError::BufferBusy { buffer }),
            other => EngineError::from(other),
        })
    }

    /// Submits a read of `length` bytes at `offset` into `buffer`.
    pub fn read(
        &self,
        path: impl AsRef<Path>,
        buffer: &SharedBuffer,
        offset: u64,
        length: usize,
    ) -> Result<Token, EngineError> {
        self.submit(Direction::Read, path.as_ref(), buffer, offset, length)
    }

    /// Submits a write of the first `length` bytes of `buffer` at `offset`.
    pub fn write(
        &self,
        path: impl AsRef<Path>,
        buffer: &SharedBuffer,
        offset: u64,
        length: usize,
    ) -> Result<Token, EngineError> {
        self.submit(Direction::Write, path.as_ref(), buffer, offset, length)
    }

    /// Submits a read and waits for it.
    pub fn sync_read(
        &self,
        path: impl AsRef<Path>,
        buffer: &SharedBuffer,
        offset: u64,
        length: usize,
    ) -> Result<Completion, EngineError> {
        let token = self.read(path, buffer, offset, length)?;
        self.wait(token)
    }

    /// Submits a write and waits for it.
    pub fn sync_write(
        &self,
        path: impl AsRef<Path>,
        buffer: &SharedBuffer,
        offset: u64,
        length: usize,
    ) -> Result<Completion, EngineError> {
        let token = self.write(path, buffer, offset, length)?;
        self.wait(token)
    }

    fn check_accepting(&self) -> Result<(), EngineError> {
        let lifecycle = self.lifecycle();
        match lifecycle.phase {
            Phase::Created => Err(EngineError::NotOpen),
            Phase::Closed => Err(EngineError::Closed),
            Phase::Open if lifecycle.drainers > 0 && !self.config.overlap_events => {
                Err(SubmissionError::Draining.into())
            }
            Phase::Open => Ok(()),
        }
    }

    fn submit(
        &self,
        direction: Direction,
        path: &Path,
        buffer: &SharedBuffer,
        offset: u64,
        length: usize,
    ) -> Result<Token, EngineError> {
        self.check_accepting()?;

        if length > buffer.len() {
            return Err(SubmissionError::LengthExceedsBuffer {
                length,
                buffer_len: buffer.len(),
            }
            .into());
        }
        let lease = buffer.lease().map_err(|e| match e {
            AllocationError::InUse { buffer } => EngineError::from(SubmissionError::BufferBusy { buffer }),
            other => EngineError::from(other),
        })?;

        let op = OpId::new(self.next_op.fetch_add(1, Ordering::Relaxed));
        let token = self.shared.tracker.register(op);
        let desc = OperationDescriptor::new(op, direction, path.to_path_buf(), offset, length, lease);

        // Counted before the push so a worker can never report the operation
        // finished before it was counted as submitted.
        self.shared.stats.record_submit();
        match self.shared.queue.push(desc, self.config.submit_timeout()) {
            Ok(()) => {
                tracing::debug!(
                    handle = self.id,
                    %op,
                    %direction,
                    path = %path.display(),
                    offset,
                    length,
                    buffer = buffer.id(),
                    "operation submitted"
                );
                Ok(token)
            }
            Err(e) => {
                self.shared.stats.unrecord_submit();
                self.shared.tracker.discard(token);
                Err(match e {
                    PushError::Closed => EngineError::Closed,
                    PushError::Full { waited } => {
                        tracing::warn!(handle = self.id, ?waited, "submission timed out on a full queue");
                        SubmissionError::QueueFull { waited }.into()
                    }
                })
            }
        }
    }

    /// Blocks until the operation finishes and returns its result.
    ///
    /// Works after `close`, for tokens issued before it.
    pub fn wait(&self, token: Token) -> OpResult {
        self.shared.tracker.wait(token)
    }

    /// Returns the result if the operation finished, or hands the token back.
    pub fn poll(&self, token: Token) -> PollOutcome {
        self.shared.tracker.poll(token)
    }

    /// Waits for every operation outstanding when the call starts and takes
    /// all their results, including ones finished earlier and never claimed.
    ///
    /// Tokens for the returned operations become invalid.
    pub fn wait_all(&self) -> Result<Vec<(OpId, OpResult)>, EngineError> {
        let ids = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.phase == Phase::Created {
                return Err(EngineError::NotOpen);
            }
            lifecycle.drainers += 1;
            // Taken under the lifecycle lock so that anything submitted after
            // the handle reports Draining is excluded.
            self.shared.tracker.snapshot()
        };
        let _drain = DrainGuard { handle: self };

        let results = self.shared.tracker.wait_for(ids);
        tracing::debug!(handle = self.id, count = results.len(), "drained completions");
        Ok(results)
    }

    /// Removes an operation that no worker has started.
    ///
    /// Returns the token unchanged if the operation already started or
    /// finished; its result is then still available through it.
    pub fn cancel(&self, token: Token) -> Result<(), Token> {
        match self.shared.queue.cancel(token.op()) {
            Some(desc) => {
                drop(desc);
                tracing::debug!(handle = self.id, op = %token.op(), "operation cancelled");
                self.shared.tracker.discard(token);
                self.shared.stats.record_cancel();
                Ok(())
            }
            None => Err(token),
        }
    }

    /// Stops accepting operations, lets every queued one finish, stops the
    /// workers, and releases the handle's buffers.
    ///
    /// Results stay available through outstanding tokens. A second call
    /// reports [`EngineError::Closed`].
    pub fn close(&self) -> Result<(), EngineError> {
        let Some(pool) = self.begin_close()? else {
            return Ok(());
        };

        self.shared.queue.close();
        self.shared.queue.wait_idle();
        self.finish_close(pool, "engine closed");
        Ok(())
    }

    /// Like [`close`](Self::close), but operations still queued are completed
    /// with [`EngineError::Shutdown`] instead of executed. Operations already
    /// executing finish normally.
    pub fn shutdown(&self) -> Result<(), EngineError> {
        let Some(pool) = self.begin_close()? else {
            return Ok(());
        };

        self.shared.queue.close();
        let abandoned = self.shared.queue.drain_pending();
        if !abandoned.is_empty() {
            tracing::warn!(handle = self.id, count = abandoned.len(), "abandoning queued operations");
        }
        for desc in abandoned {
            self.shared.abandon(desc);
        }
        self.shared.queue.wait_idle();
        self.finish_close(pool, "engine shut down");
        Ok(())
    }

    /// Moves to `Closed`; returns the pool to join if workers were running.
    fn begin_close(&self) -> Result<Option<WorkerPool>, EngineError> {
        let mut lifecycle = self.lifecycle();
        let was = lifecycle.phase;
        match was {
            Phase::Closed => Err(EngineError::Closed),
            Phase::Created => {
                lifecycle.phase = Phase::Closed;
                drop(lifecycle);
                self.buffers.release_all();
                tracing::info!(handle = self.id, "engine closed before opening");
                Ok(None)
            }
            Phase::Open => {
                lifecycle.phase = Phase::Closed;
                Ok(lifecycle.pool.take())
            }
        }
    }

    fn finish_close(&self, pool: WorkerPool, message: &'static str) {
        self.shared.queue.stop();
        pool.join();
        let (released, busy) = self.buffers.release_all();
        let stats = self.stats();
        tracing::info!(
            handle = self.id,
            released_buffers = released,
            busy_buffers = busy,
            unclaimed_results = self.shared.tracker.unclaimed(),
            submitted = stats.submitted,
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            abandoned = stats.abandoned,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            "{}",
            message
        );
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id)
            .field("backend", &self.backend_name())
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.lifecycle().phase != Phase::Closed {
            // Only fails when already closed.
            let _ = self.shutdown();
        }
    }
}

struct DrainGuard<'a> {
    handle: &'a EngineHandle,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.handle.lifecycle();
        lifecycle.drainers = lifecycle.drainers.saturating_sub(1);
    }
}
