//! Engine error types.
//!
//! Allocation, configuration, and submission problems are returned from the
//! call that caused them. Transfer failures happen on a worker thread and are
//! delivered through the completion token instead.

use std::path::PathBuf;
use std::time::Duration;

use nvswap_io::AllocationError;

use crate::descriptor::{Direction, OpId};

/// Errors surfaced by engine handles and the one-shot path.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A buffer could not be allocated, pinned, or accessed.
    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// The operation was not accepted into the queue.
    #[error("submission rejected: {0}")]
    Submission(#[from] SubmissionError),

    /// The transfer itself failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The handle was created but `open` has not been called.
    #[error("engine handle is not open")]
    NotOpen,

    /// The handle was closed before this call.
    #[error("engine handle is closed")]
    Closed,

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Settings the engine cannot run with, or a missing platform facility.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The operation was still queued when the engine shut down.
    #[error("operation {op} abandoned by engine shutdown")]
    Shutdown { op: OpId },

    /// The token does not belong to this handle or was already consumed.
    #[error("unknown or already consumed token for operation {op}")]
    InvalidToken { op: OpId },
}

impl EngineError {
    /// Returns the transfer error, if this is one.
    pub fn as_transfer(&self) -> Option<&TransferError> {
        match self {
            EngineError::Transfer(e) => Some(e),
            _ => None,
        }
    }
}

/// Reasons a submission is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    /// No queue slot freed up within the configured timeout.
    #[error("queue stayed full for {waited:?}")]
    QueueFull { waited: Duration },

    /// A `wait_all` is draining and overlapped submission is disabled.
    #[error("handle is draining; submit again once wait_all returns")]
    Draining,

    /// The buffer is held by another operation or a caller guard.
    #[error("buffer {buffer} is in use by another operation")]
    BufferBusy { buffer: u64 },

    /// The requested length does not fit in the buffer.
    #[error("length {length} exceeds buffer length {buffer_len}")]
    LengthExceedsBuffer { length: usize, buffer_len: usize },
}

/// A failed read or write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "{direction} of {length} bytes at offset {offset} in {path} failed after {transferred} bytes: {kind}"
)]
pub struct TransferError {
    pub op: OpId,
    pub direction: Direction,
    pub path: PathBuf,
    pub offset: u64,
    pub length: usize,
    /// Bytes moved before the failure.
    pub transferred: usize,
    pub kind: TransferErrorKind,
}

impl TransferError {
    /// Returns the OS error code, if the failure came from a system call.
    pub fn os_code(&self) -> Option<i32> {
        match &self.kind {
            TransferErrorKind::Os { code, .. } => *code,
            _ => None,
        }
    }
}

/// What went wrong during a transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferErrorKind {
    /// A system call failed with a permanent error.
    #[error("{message}")]
    Os { code: Option<i32>, message: String },

    /// The device kept returning short transfers.
    #[error("short transfer persisted after {retries} retries")]
    Short { retries: u32 },

    /// Read-back verification found different bytes.
    #[error("read-back mismatch at byte {first_mismatch}")]
    Validation { first_mismatch: usize },

    /// The worker panicked while executing the operation.
    #[error("worker panicked during transfer")]
    WorkerPanic,
}
