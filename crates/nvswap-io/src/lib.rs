//! # nvswap-io: Buffers and Storage Backends for nvswap
//!
//! This crate holds the leaf layer of the offload engine: memory that is
//! safe to hand to unbuffered storage I/O, and the backends that move bytes
//! between that memory and files.
//!
//! - **[`AlignedBuffer`]**: an owned, zeroed allocation whose base address and
//!   capacity are multiples of the requested alignment, optionally pinned
//!   with `mlock(2)`.
//! - **[`BufferManager`] / [`SharedBuffer`]**: allocation, tracking, and
//!   explicit release of buffers shared between callers and worker threads.
//! - **[`SyncBackend`]**: positional `pread`/`pwrite` with `O_DIRECT` on Linux,
//!   falling back to buffered I/O when the filesystem refuses direct access.
//! - **[`GdsBackend`]**: the GPU-direct storage route, gated on the nvidia-fs
//!   driver being present.
//! - **[`UringBackend`]**: the same file handling with transfers batched
//!   through io_uring.
//! - **[`IoQueue`]**: per-thread submission of several requests at once,
//!   with [`BlockingQueue`] emulating it over blocking calls.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │          nvswap          │
//! │ (queue, workers, handle) │
//! └────────────┬─────────────┘
//!              │ IoBackend
//! ┌────────────┴─────────────────────┐
//! │            nvswap-io             │
//! │  IoQueue: io_uring | blocking    │
//! │  ┌─────────┐ ┌────────┐ ┌──────┐ │
//! │  │  Sync   │ │ Uring  │ │ GDS  │ │
//! │  │ Backend │ │Backend │ │      │ │
//! │  └─────────┘ └────────┘ └──────┘ │
//! └──────────────────────────────────┘
//! ```

mod aio;
mod aligned;
mod backend;
mod buffer;
mod error;
mod gds;
mod sync_backend;
mod uring;

pub use aio::{BlockingQueue, IoCompletion, IoKind, IoQueue, IoRequest, open_queue, perform};
pub use aligned::{AlignedBuffer, BLOCK_ALIGNMENT, MIN_ALIGNMENT, is_aligned, round_up};
pub use backend::{FileHandle, IoBackend, OpenFlags};
pub use buffer::{BufferGuard, BufferLease, BufferManager, SharedBuffer};
pub use error::{AllocationError, IoError};
pub use gds::{GdsBackend, NVIDIA_FS_PROC_PATH};
pub use sync_backend::SyncBackend;
pub use uring::UringBackend;

#[cfg(test)]
mod tests;
