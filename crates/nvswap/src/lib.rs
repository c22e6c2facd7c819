//! # nvswap: Asynchronous Block-Storage Offload Engine
//!
//! `nvswap` moves large buffers between host memory and files (including
//! NVMe devices and the GPU-direct storage route) on a pool of worker
//! threads, so the submitting thread only pays for queueing.
//!
//! # Call styles
//!
//! - **[`EngineHandle`]**: a persistent engine. Submit any number of reads
//!   and writes, get a [`Token`] for each, and redeem tokens with
//!   [`wait`](EngineHandle::wait), [`poll`](EngineHandle::poll), or
//!   [`wait_all`](EngineHandle::wait_all).
//! - **[`oneshot`]**: one operation per call. A private single-worker
//!   handle is created and torn down around it; errors come back
//!   synchronously.
//! - **[`Engine`]**: picks one of the two from a [`CallStyle`].
//!
//! # Architecture
//!
//! ```text
//!  caller ──read/write──▶ EngineHandle ──descriptor──▶ SubmissionQueue
//!    ▲                                                     │ FIFO
//!    │ wait/poll                                           ▼
//!  CompletionTracker ◀──────── publish ──────────── worker threads
//!                                                          │
//!                                                     IoBackend
//!                                                (POSIX / GPU-direct)
//! ```
//!
//! # Guarantees
//!
//! - Operations on overlapping bytes of the same file through one handle
//!   complete in submission order.
//! - A buffer belongs to at most one in-flight operation; reuse before
//!   completion is rejected with [`SubmissionError::BufferBusy`].
//! - Every accepted token yields exactly one result, including after
//!   [`shutdown`](EngineHandle::shutdown), which fails queued operations
//!   with [`EngineError::Shutdown`].

mod completion;
mod descriptor;
mod engine;
mod error;
mod handle;
pub mod oneshot;
mod pool;
mod queue;
mod stats;
mod transfer;

pub use completion::{OpResult, PollOutcome, Token};
pub use descriptor::{Completion, Direction, OpId, OperationDescriptor};
pub use engine::{CallStyle, Engine};
pub use error::{EngineError, SubmissionError, TransferError, TransferErrorKind};
pub use handle::{EngineHandle, HandleState};
pub use stats::StatsSnapshot;

pub use nvswap_config::AioConfig;
pub use nvswap_io::{AllocationError, BufferManager, SharedBuffer};
