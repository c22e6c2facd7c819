//! GPU-direct storage route.
//!
//! GPUDirect Storage moves data between NVMe and device memory through the
//! `nvidia-fs` kernel module. Without the module there is no GPU-direct path
//! at all, so [`GdsBackend::check_available`] refuses to start instead of
//! quietly degrading to host copies the caller did not ask for.
//!
//! With the module loaded, buffers handed to this backend are pinned host
//! memory, and transfers run in compatibility mode: unbuffered POSIX I/O
//! that the driver can service with the same DMA path. O_DIRECT is used
//! whenever the caller requests it; the engine does so for every aligned
//! transfer.

use std::path::{Path, PathBuf};

use crate::backend::{FileHandle, IoBackend, OpenFlags};
use crate::{IoError, SyncBackend};

/// procfs entry published by the nvidia-fs kernel module.
pub const NVIDIA_FS_PROC_PATH: &str = "/proc/driver/nvidia-fs";

/// Backend for the GPU-direct storage route.
#[derive(Debug)]
pub struct GdsBackend {
    driver_path: PathBuf,
    posix: SyncBackend,
}

impl GdsBackend {
    /// Creates a backend that looks for the driver at the standard nvidia-fs location.
    pub fn new() -> Self {
        Self::with_driver_path(NVIDIA_FS_PROC_PATH)
    }

    /// Creates a backend that looks for the driver at `driver_path` instead.
    pub fn with_driver_path(driver_path: impl AsRef<Path>) -> Self {
        Self {
            driver_path: driver_path.as_ref().to_path_buf(),
            posix: SyncBackend::new(),
        }
    }

    /// Returns true if the nvidia-fs driver is loaded.
    pub fn driver_present(&self) -> bool {
        self.driver_path.exists()
    }
}

impl Default for GdsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBackend for GdsBackend {
    fn name(&self) -> &'static str {
        "gds"
    }

    fn check_available(&self) -> Result<(), IoError> {
        if !cfg!(target_os = "linux") {
            return Err(IoError::Unavailable {
                facility: "GPUDirect Storage",
                hint: "GPU-direct storage is only supported on Linux".to_string(),
            });
        }
        if !self.driver_present() {
            return Err(IoError::Unavailable {
                facility: "GPUDirect Storage",
                hint: format!(
                    "nvidia-fs driver not found at {}; load the nvidia_fs module or disable use_gds",
                    self.driver_path.display()
                ),
            });
        }
        tracing::warn!(
            driver = %self.driver_path.display(),
            "GPU-direct route running in compatibility mode over unbuffered host I/O"
        );
        self.posix.check_available()
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, IoError> {
        let handle = self.posix.open(path, flags)?;
        if flags.direct && !handle.is_direct() {
            tracing::warn!(path = %path.display(), "GPU-direct transfer falling back to buffered I/O");
        }
        Ok(handle)
    }

    fn read_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        self.posix.read_at(handle, offset, buf)
    }

    fn write_at(&self, handle: &FileHandle, offset: u64, buf: &[u8]) -> Result<usize, IoError> {
        self.posix.write_at(handle, offset, buf)
    }

    fn fsync(&self, handle: &FileHandle) -> Result<(), IoError> {
        self.posix.fsync(handle)
    }

    fn close(&self, handle: FileHandle) -> Result<(), IoError> {
        self.posix.close(handle)
    }

    fn file_size(&self, handle: &FileHandle) -> Result<u64, IoError> {
        self.posix.file_size(handle)
    }
}
