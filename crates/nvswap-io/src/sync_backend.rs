//! Synchronous I/O backend using `std::fs`.
//!
//! Positional reads and writes go through `pread(2)`/`pwrite(2)` (via
//! `FileExt`), so concurrent workers never share a file cursor. Files opened
//! with `OpenFlags::direct = true` on Linux use `O_DIRECT`. Filesystems that
//! refuse it (tmpfs, some FUSE mounts) answer `EINVAL` at open time; the
//! backend then reopens the file buffered and records that on the handle.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::IoError;
use crate::backend::{FileHandle, IoBackend, OpenFlags};

/// Synchronous I/O backend using `std::fs::File`.
#[derive(Debug)]
pub struct SyncBackend {
    /// Counter for generating unique file handle IDs.
    next_handle_id: AtomicU64,
}

impl SyncBackend {
    /// Creates a new synchronous I/O backend.
    pub fn new() -> Self {
        Self {
            next_handle_id: AtomicU64::new(1),
        }
    }

    /// Returns the next unique handle ID.
    fn next_id(&self) -> u64 {
        self.next_handle_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns true if this build can request O_DIRECT at all.
    pub fn supports_direct_io() -> bool {
        cfg!(target_os = "linux")
    }

    fn open_with(path: &Path, flags: OpenFlags, direct: bool) -> std::io::Result<std::fs::File> {
        let mut opts = OpenOptions::new();
        opts.read(flags.read).write(flags.write).create(flags.create);

        #[cfg(target_os = "linux")]
        if direct {
            use std::os::unix::fs::OpenOptionsExt;
            opts.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct;

        opts.open(path)
    }
}

impl Default for SyncBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBackend for SyncBackend {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn check_available(&self) -> Result<(), IoError> {
        if cfg!(any(unix, windows)) {
            Ok(())
        } else {
            Err(IoError::Unavailable {
                facility: "positional file I/O",
                hint: "this platform has no pread/pwrite equivalent".to_string(),
            })
        }
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, IoError> {
        let want_direct = flags.direct && Self::supports_direct_io();

        let result = match Self::open_with(path, flags, want_direct) {
            Ok(file) => Ok((file, want_direct)),
            Err(e) if want_direct && e.kind() == std::io::ErrorKind::InvalidInput => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "filesystem rejected O_DIRECT, falling back to buffered I/O"
                );
                Self::open_with(path, flags, false).map(|file| (file, false))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((file, direct)) => Ok(FileHandle::from_file(
                self.next_id(),
                path.to_path_buf(),
                direct,
                file,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(IoError::NotFound {
                path: path.to_path_buf(),
                source: e,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn read_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        let file = handle.file()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(file.read_at(buf, offset)?)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            Ok(file.seek_read(buf, offset)?)
        }
    }

    fn write_at(&self, handle: &FileHandle, offset: u64, buf: &[u8]) -> Result<usize, IoError> {
        let file = handle.file()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(file.write_at(buf, offset)?)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            Ok(file.seek_write(buf, offset)?)
        }
    }

    fn fsync(&self, handle: &FileHandle) -> Result<(), IoError> {
        handle.file()?.sync_all()?;
        Ok(())
    }

    fn close(&self, mut handle: FileHandle) -> Result<(), IoError> {
        // Drop the file to close it
        handle.file = None;
        Ok(())
    }

    fn file_size(&self, handle: &FileHandle) -> Result<u64, IoError> {
        let metadata = handle.file()?.metadata()?;
        Ok(metadata.len())
    }
}
