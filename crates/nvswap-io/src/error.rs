//! I/O and allocation error types.

use std::path::PathBuf;

/// Errors from an I/O backend.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Underlying OS I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// File not found.
    #[error("file not found: {}", .path.display())]
    NotFound {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid file handle.
    #[error("invalid file handle: {handle}")]
    InvalidHandle { handle: u64 },

    /// Alignment error for Direct I/O.
    #[error("buffer not aligned to {required} bytes (actual alignment: {actual})")]
    AlignmentError { required: usize, actual: usize },

    /// A platform facility the backend depends on is missing.
    #[error("{facility} is unavailable: {hint}")]
    Unavailable {
        facility: &'static str,
        hint: String,
    },

    /// The backend panicked while servicing a request.
    #[error("backend panicked during {operation}")]
    Panicked { operation: &'static str },
}

impl IoError {
    /// Returns the OS error code behind this error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IoError::Io { source } | IoError::NotFound { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Returns true for errors worth retrying transparently: an interrupted
    /// system call or a descriptor that would have blocked.
    pub fn is_transient(&self) -> bool {
        match self {
            IoError::Io { source } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Returns true if the backend panicked instead of returning.
    pub fn is_panic(&self) -> bool {
        matches!(self, IoError::Panicked { .. })
    }

    /// Returns true if the call was interrupted by a signal.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, IoError::Io { source } if source.kind() == std::io::ErrorKind::Interrupted)
    }
}

/// Errors from allocating, pinning, accessing, or releasing a buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Alignment is zero, not a power of two, or below the supported minimum.
    #[error("invalid alignment {alignment}: must be a power of two >= {minimum}")]
    InvalidAlignment { alignment: usize, minimum: usize },

    /// Length is zero or too large to lay out.
    #[error("invalid buffer length {length}")]
    InvalidLength { length: usize },

    /// The allocator returned no memory.
    #[error("out of memory allocating {capacity} bytes")]
    OutOfMemory { capacity: usize },

    /// The kernel refused to lock the pages in memory.
    #[error("cannot pin {capacity} bytes (os error {code}); raise RLIMIT_MEMLOCK")]
    PinLimit { capacity: usize, code: i32 },

    /// Pinning is not available on this platform.
    #[error("memory pinning is not supported on this platform")]
    PinUnsupported,

    /// The buffer is referenced by an operation or an outstanding guard.
    #[error("buffer {buffer} is in use")]
    InUse { buffer: u64 },

    /// The buffer was already released.
    #[error("buffer {buffer} was already released")]
    AlreadyReleased { buffer: u64 },
}
