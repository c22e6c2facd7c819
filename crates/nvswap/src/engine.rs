//! Blocking front door over both call styles.

use std::fmt;
use std::path::Path;

use nvswap_config::AioConfig;
use nvswap_io::SharedBuffer;

use crate::descriptor::Completion;
use crate::error::EngineError;
use crate::handle::EngineHandle;
use crate::oneshot;

/// How an [`Engine`] issues operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallStyle {
    /// A fresh single-worker handle per call.
    #[default]
    OneShot,
    /// One persistent handle for every call.
    Handle,
}

impl fmt::Display for CallStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStyle::OneShot => f.write_str("one-shot"),
            CallStyle::Handle => f.write_str("handle"),
        }
    }
}

/// Synchronous read and write calls, routed through the one-shot path or a
/// persistent [`EngineHandle`] depending on the [`CallStyle`] chosen at
/// construction.
#[derive(Debug)]
pub enum Engine {
    OneShot(AioConfig),
    Handle(EngineHandle),
}

impl Engine {
    pub fn new(config: AioConfig, style: CallStyle) -> Result<Self, EngineError> {
        match style {
            CallStyle::OneShot => {
                config
                    .validate()
                    .map_err(|e| EngineError::Configuration(e.to_string()))?;
                Ok(Engine::OneShot(config))
            }
            CallStyle::Handle => Ok(Engine::Handle(EngineHandle::start(config)?)),
        }
    }

    pub fn style(&self) -> CallStyle {
        match self {
            Engine::OneShot(_) => CallStyle::OneShot,
            Engine::Handle(_) => CallStyle::Handle,
        }
    }

    pub fn read(
        &self,
        path: impl AsRef<Path>,
        buffer: &SharedBuffer,
        offset: u64,
        length: usize,
    ) -> Result<Completion, EngineError> {
        match self {
            Engine::OneShot(config) => oneshot::read_with(config, path, buffer, offset, length),
            Engine::Handle(handle) => handle.sync_read(path, buffer, offset, length),
        }
    }

    pub fn write(
        &self,
        path: impl AsRef<Path>,
        buffer: &SharedBuffer,
        offset: u64,
        length: usize,
    ) -> Result<Completion, EngineError> {
        match self {
            Engine::OneShot(config) => oneshot::write_with(config, path, buffer, offset, length),
            Engine::Handle(handle) => handle.sync_write(path, buffer, offset, length),
        }
    }

    /// Closes the persistent handle, if there is one.
    pub fn close(self) -> Result<(), EngineError> {
        match self {
            Engine::OneShot(_) => Ok(()),
            Engine::Handle(handle) => handle.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvswap_io::BufferManager;
    use tempfile::tempdir;
    use test_case::test_case;

    #[test_case(CallStyle::OneShot; "one shot")]
    #[test_case(CallStyle::Handle; "handle")]
    fn both_styles_round_trip(style: CallStyle) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{style}.bin"));
        let config = AioConfig {
            block_size: 4096,
            ..AioConfig::default()
        };
        let engine = Engine::new(config, style).unwrap();
        assert_eq!(engine.style(), style);

        let manager = BufferManager::default();
        let buf = manager.allocate(4096, 4096).unwrap();
        buf.copy_from_slice(&[3u8; 4096]).unwrap();
        engine.write(&path, &buf, 4096, 4096).unwrap();

        let back = manager.allocate(4096, 4096).unwrap();
        let done = engine.read(&path, &back, 4096, 4096).unwrap();
        assert_eq!(done.bytes, 4096);
        assert_eq!(&back.snapshot().unwrap()[..], &[3u8; 4096][..]);
        engine.close().unwrap();
    }
}
