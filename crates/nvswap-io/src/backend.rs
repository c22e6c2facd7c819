//! I/O backend trait.
//!
//! The [`IoBackend`] trait abstracts positional file I/O so the engine's
//! workers can run against:
//! - Standard POSIX I/O, buffered or with O_DIRECT ([`crate::SyncBackend`])
//! - The GPU-direct storage route ([`crate::GdsBackend`])
//! - Fault-injecting mocks in tests
//!
//! Every positional call is blocking. Backends with a kernel completion
//! interface additionally hand out an [`IoQueue`] so that one thread can
//! keep several transfers in flight; the rest are driven through
//! [`crate::BlockingQueue`].

use std::path::{Path, PathBuf};

use crate::IoError;
use crate::aio::IoQueue;

/// Flags for opening files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Create the file if it doesn't exist.
    pub create: bool,
    /// Use Direct I/O (O_DIRECT on Linux, ignored elsewhere).
    pub direct: bool,
}

impl OpenFlags {
    /// Flags for reading an existing file.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Flags for writing into a file, creating it if needed. Existing
    /// contents outside the written range are preserved.
    pub fn write_create() -> Self {
        Self {
            write: true,
            create: true,
            ..Self::default()
        }
    }

    /// Returns these flags with Direct I/O switched on or off.
    pub fn with_direct(self, direct: bool) -> Self {
        Self { direct, ..self }
    }
}

/// Handle to an open file.
///
/// Records whether the descriptor was actually opened with O_DIRECT, which
/// can differ from the requested flags when the filesystem refused it.
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) id: u64,
    pub(crate) path: PathBuf,
    pub(crate) direct: bool,
    pub(crate) file: Option<std::fs::File>,
}

impl FileHandle {
    /// Creates a new file handle wrapping a `std::fs::File`.
    ///
    /// Public so that wrapping backends (and test doubles) can mint handles.
    pub fn from_file(id: u64, path: PathBuf, direct: bool, file: std::fs::File) -> Self {
        Self {
            id,
            path,
            direct,
            file: Some(file),
        }
    }

    /// Returns the backend-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the path the handle was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the descriptor bypasses the page cache.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Returns the underlying file.
    pub fn file(&self) -> Result<&std::fs::File, IoError> {
        self.file
            .as_ref()
            .ok_or(IoError::InvalidHandle { handle: self.id })
    }
}

/// Abstraction over positional file I/O.
pub trait IoBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Verifies that the platform facilities this backend depends on exist.
    ///
    /// Engines call this once at construction and refuse to start on error.
    fn check_available(&self) -> Result<(), IoError>;

    /// Opens a file with the given flags.
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, IoError>;

    /// Reads into `buf` from the given byte offset.
    ///
    /// Returns the number of bytes read; fewer than `buf.len()` means end of
    /// file or a short transfer the caller must retry.
    fn read_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Writes `buf` at the given byte offset.
    ///
    /// Returns the number of bytes written.
    fn write_at(&self, handle: &FileHandle, offset: u64, buf: &[u8]) -> Result<usize, IoError>;

    /// Syncs file data and metadata to disk.
    fn fsync(&self, handle: &FileHandle) -> Result<(), IoError>;

    /// Closes a file handle.
    fn close(&self, handle: FileHandle) -> Result<(), IoError>;

    /// Returns the file size in bytes.
    fn file_size(&self, handle: &FileHandle) -> Result<u64, IoError>;

    /// Opens a kernel submission queue for `depth` in-flight requests.
    ///
    /// Returns `Ok(None)` when the backend has no such interface.
    fn io_queue(&self, depth: usize) -> Result<Option<Box<dyn IoQueue>>, IoError> {
        let _ = depth;
        Ok(None)
    }
}
