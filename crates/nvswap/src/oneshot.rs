//! Stateless one-operation calls.
//!
//! Each call opens a private handle with a single worker and a single queue
//! slot, runs exactly one operation, closes the handle, and returns the
//! result synchronously. Transfer errors come back from the call itself.

use std::path::Path;

use nvswap_config::AioConfig;
use nvswap_io::{BufferManager, SharedBuffer};

use crate::descriptor::{Completion, Direction};
use crate::error::EngineError;
use crate::handle::EngineHandle;

/// Reads `length` bytes at `offset` into `buffer` with default settings.
pub fn read(
    path: impl AsRef<Path>,
    buffer: &SharedBuffer,
    offset: u64,
    length: usize,
) -> Result<Completion, EngineError> {
    read_with(&AioConfig::default(), path, buffer, offset, length)
}

/// Writes the first `length` bytes of `buffer` at `offset` with default
/// settings.
pub fn write(
    path: impl AsRef<Path>,
    buffer: &SharedBuffer,
    offset: u64,
    length: usize,
) -> Result<Completion, EngineError> {
    write_with(&AioConfig::default(), path, buffer, offset, length)
}

/// [`read`] with explicit settings. Queue depth and thread count are
/// overridden to one.
pub fn read_with(
    config: &AioConfig,
    path: impl AsRef<Path>,
    buffer: &SharedBuffer,
    offset: u64,
    length: usize,
) -> Result<Completion, EngineError> {
    run(config, Direction::Read, path.as_ref(), buffer, offset, length)
}

/// [`write`] with explicit settings. Queue depth and thread count are
/// overridden to one.
pub fn write_with(
    config: &AioConfig,
    path: impl AsRef<Path>,
    buffer: &SharedBuffer,
    offset: u64,
    length: usize,
) -> Result<Completion, EngineError> {
    run(config, Direction::Write, path.as_ref(), buffer, offset, length)
}

/// Allocates a buffer of `length` bytes and reads into it.
///
/// The buffer is not tied to any handle; it is freed when the last clone is
/// dropped.
pub fn read_to_buffer(
    config: &AioConfig,
    path: impl AsRef<Path>,
    offset: u64,
    length: usize,
) -> Result<SharedBuffer, EngineError> {
    let manager = BufferManager::new(config.pin_buffers);
    let buffer = manager.allocate(length, config.alignment)?;
    read_with(config, path, &buffer, offset, length)?;
    Ok(buffer)
}

fn run(
    config: &AioConfig,
    direction: Direction,
    path: &Path,
    buffer: &SharedBuffer,
    offset: u64,
    length: usize,
) -> Result<Completion, EngineError> {
    let handle = EngineHandle::start(config.one_shot())?;
    let token = match direction {
        Direction::Read => handle.read(path, buffer, offset, length)?,
        Direction::Write => handle.write(path, buffer, offset, length)?,
    };
    let result = handle.wait(token);
    handle.close()?;

    if let Err(e) = &result {
        tracing::debug!(%direction, path = %path.display(), offset, length, error = %e, "one-shot transfer failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small() -> AioConfig {
        AioConfig {
            block_size: 4096,
            ..AioConfig::default()
        }
    }

    #[test]
    fn write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oneshot.bin");
        let manager = BufferManager::default();

        let out = manager.allocate(8192, 4096).unwrap();
        out.copy_from_slice(&[0x5a; 8192]).unwrap();
        let done = write_with(&small(), &path, &out, 0, 8192).unwrap();
        assert_eq!(done.bytes, 8192);
        assert_eq!(done.direction, Direction::Write);

        let back = read_to_buffer(&small(), &path, 0, 8192).unwrap();
        assert_eq!(&back.snapshot().unwrap()[..], &[0x5a; 8192][..]);
    }

    #[test]
    fn invalid_config_is_rejected_synchronously() {
        let manager = BufferManager::default();
        let buf = manager.allocate(4096, 4096).unwrap();
        let config = AioConfig {
            block_size: 1000,
            ..AioConfig::default()
        };

        let err = read_with(&config, "/nonexistent", &buf, 0, 4096).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(!buf.is_busy());
    }
}
