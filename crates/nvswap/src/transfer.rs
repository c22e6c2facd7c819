//! Execution of a single operation as a sequence of device requests.
//!
//! A [`Transfer`] opens its file, then hands out one [`IoRequest`] at a time,
//! each covering at most `block_size` bytes, and folds every completion back
//! in. Between requests the transfer owns nothing: the file handle and the
//! buffer lease travel inside the request and come back with the completion,
//! so a worker can keep many transfers in flight on one submission queue.

use std::path::{Path, PathBuf};
use std::time::Instant;

use nvswap_config::AioConfig;
use nvswap_io::{
    BufferLease, FileHandle, IoBackend, IoCompletion, IoError, IoKind, IoRequest, OpenFlags,
    is_aligned,
};

use crate::descriptor::{Completion, Direction, OpId, OperationDescriptor};
use crate::error::{TransferError, TransferErrorKind};

/// The parts of [`AioConfig`] a worker needs per transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransferSettings {
    pub(crate) alignment: usize,
    pub(crate) block_size: usize,
    pub(crate) direct_io: bool,
    pub(crate) validate: bool,
    pub(crate) max_retries: u32,
}

impl From<&AioConfig> for TransferSettings {
    fn from(config: &AioConfig) -> Self {
        Self {
            alignment: config.alignment,
            block_size: config.block_size,
            direct_io: config.direct_io,
            validate: config.validate,
            max_retries: config.max_retries,
        }
    }
}

fn os_kind(err: &IoError) -> TransferErrorKind {
    TransferErrorKind::Os {
        code: err.raw_os_error(),
        message: err.to_string(),
    }
}

fn flags_for(direction: Direction) -> OpenFlags {
    match direction {
        Direction::Read => OpenFlags::read_only(),
        Direction::Write => OpenFlags::write_create(),
    }
}

/// What an operation was asked to do; enough to report its failure even
/// after the rest of its state is gone.
#[derive(Debug, Clone)]
pub(crate) struct Origin {
    pub(crate) op: OpId,
    pub(crate) direction: Direction,
    pub(crate) path: PathBuf,
    pub(crate) offset: u64,
    pub(crate) length: usize,
}

impl Origin {
    pub(crate) fn of(desc: &OperationDescriptor) -> Self {
        Self {
            op: desc.id,
            direction: desc.direction(),
            path: desc.path.clone(),
            offset: desc.offset,
            length: desc.length,
        }
    }

    pub(crate) fn error(&self, transferred: usize, kind: TransferErrorKind) -> TransferError {
        TransferError {
            op: self.op,
            direction: self.direction,
            path: self.path.clone(),
            offset: self.offset,
            length: self.length,
            transferred,
            kind,
        }
    }

    /// The outcome of an operation whose state was lost to a panic. Its lease
    /// was dropped while unwinding.
    pub(crate) fn panicked(&self, transferred: usize) -> Finished {
        Finished {
            op: self.op,
            lease: None,
            result: Err(self.error(transferred, TransferErrorKind::WorkerPanic)),
        }
    }
}

/// A transfer that has ended, successfully or not.
#[derive(Debug)]
pub(crate) struct Finished {
    pub(crate) op: OpId,
    /// Still held until the result is published; `None` if already dropped.
    pub(crate) lease: Option<BufferLease>,
    pub(crate) result: Result<Completion, TransferError>,
}

/// What a transfer wants next.
#[derive(Debug)]
pub(crate) enum Step {
    /// Submit the request and resume the transfer with its completion.
    Submit(Transfer, IoRequest),
    Done(Finished),
}

/// One operation between its requests.
///
/// Interrupted calls are repeated as they are. Short transfers and
/// would-block errors count against `max_retries`; a short transfer on a
/// direct handle reopens the file buffered for the remainder, since a
/// partial result leaves the rest of the range unaligned.
#[derive(Debug)]
pub(crate) struct Transfer {
    origin: Origin,
    submitted_at: Instant,
    settings: TransferSettings,
    done: usize,
    retries: u32,
    direct: bool,
}

impl Transfer {
    /// Opens the file and produces the first request.
    pub(crate) fn start(
        backend: &dyn IoBackend,
        settings: &TransferSettings,
        desc: OperationDescriptor,
    ) -> Step {
        let origin = Origin::of(&desc);
        let OperationDescriptor {
            lease, submitted_at, ..
        } = desc;

        let buffer_aligned = is_aligned(lease.data().as_ptr() as u64, settings.alignment);
        let want_direct = settings.direct_io
            && buffer_aligned
            && is_aligned(origin.offset, settings.alignment)
            && is_aligned(origin.length as u64, settings.alignment);

        let opened = backend.open(&origin.path, flags_for(origin.direction).with_direct(want_direct));
        let mut transfer = Transfer {
            origin,
            submitted_at,
            settings: *settings,
            done: 0,
            retries: 0,
            direct: false,
        };

        match opened {
            Ok(file) => {
                transfer.direct = file.is_direct();
                transfer.next(backend, file, lease)
            }
            Err(e) => {
                let kind = os_kind(&e);
                transfer.fail(lease, kind)
            }
        }
    }

    pub(crate) fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Bytes transferred so far.
    pub(crate) fn done(&self) -> usize {
        self.done
    }

    /// Folds in the completion of the last request.
    pub(crate) fn resume(mut self, backend: &dyn IoBackend, completion: IoCompletion) -> Step {
        let IoCompletion { request, result } = completion;
        let requested = request.len();
        let position = request.position;
        let IoRequest {
            mut file, lease, ..
        } = request;
        let max_retries = self.settings.max_retries;

        match result {
            Ok(n) if n == requested => {
                self.done += n;
                self.next(backend, file, lease)
            }
            Ok(n) => {
                self.done += n;
                self.retries += 1;
                if self.retries > max_retries {
                    close_quietly(backend, file);
                    return self.fail(lease, TransferErrorKind::Short { retries: max_retries });
                }
                tracing::warn!(
                    op = %self.origin.op,
                    position,
                    requested,
                    transferred = n,
                    retries = self.retries,
                    "short transfer, retrying remainder"
                );
                if file.is_direct() {
                    file = match reopen_buffered(backend, file, &self.origin.path, flags_for(self.origin.direction)) {
                        Ok(file) => file,
                        Err(e) => {
                            let kind = os_kind(&e);
                            return self.fail(lease, kind);
                        }
                    };
                }
                self.next(backend, file, lease)
            }
            Err(e) if e.is_interrupted() => self.next(backend, file, lease),
            Err(e) if e.is_transient() && self.retries < max_retries => {
                self.retries += 1;
                tracing::warn!(op = %self.origin.op, position, retries = self.retries, error = %e, "transient error, retrying");
                std::thread::yield_now();
                self.next(backend, file, lease)
            }
            Err(e) => {
                close_quietly(backend, file);
                let kind = if e.is_panic() {
                    TransferErrorKind::WorkerPanic
                } else {
                    os_kind(&e)
                };
                self.fail(lease, kind)
            }
        }
    }

    /// Ends a transfer whose request the queue could not take back.
    pub(crate) fn lost(self, err: &IoError) -> Finished {
        Finished {
            op: self.origin.op,
            lease: None,
            result: Err(self.origin.error(self.done, os_kind(err))),
        }
    }

    fn next(self, backend: &dyn IoBackend, file: FileHandle, lease: BufferLease) -> Step {
        let length = self.origin.length;
        if self.done < length {
            let chunk = (length - self.done).min(self.settings.block_size);
            let request = IoRequest {
                tag: self.origin.op.as_u64(),
                kind: match self.origin.direction {
                    Direction::Read => IoKind::Read,
                    Direction::Write => IoKind::Write,
                },
                file,
                position: self.origin.offset + self.done as u64,
                lease,
                range: self.done..self.done + chunk,
            };
            return Step::Submit(self, request);
        }

        close_quietly(backend, file);
        let result = self.conclude(backend, &lease);
        Step::Done(Finished {
            op: self.origin.op,
            lease: Some(lease),
            result,
        })
    }

    fn fail(self, lease: BufferLease, kind: TransferErrorKind) -> Step {
        Step::Done(Finished {
            op: self.origin.op,
            lease: Some(lease),
            result: Err(self.origin.error(self.done, kind)),
        })
    }

    fn conclude(&self, backend: &dyn IoBackend, lease: &BufferLease) -> Result<Completion, TransferError> {
        let origin = &self.origin;
        if self.settings.validate && origin.length > 0 {
            let data = lease.data();
            let expected = &data.as_slice()[..origin.length];
            if let Some(first_mismatch) = verify(backend, &origin.path, origin.offset, expected)
                .map_err(|e| origin.error(self.done, os_kind(&e)))?
            {
                return Err(origin.error(self.done, TransferErrorKind::Validation { first_mismatch }));
            }
        }

        Ok(Completion {
            op: origin.op,
            direction: origin.direction,
            path: origin.path.clone(),
            offset: origin.offset,
            bytes: self.done,
            direct: self.direct,
            elapsed: self.submitted_at.elapsed(),
        })
    }
}

fn reopen_buffered(
    backend: &dyn IoBackend,
    handle: FileHandle,
    path: &Path,
    flags: OpenFlags,
) -> Result<FileHandle, IoError> {
    close_quietly(backend, handle);
    backend.open(path, flags.with_direct(false))
}

fn close_quietly(backend: &dyn IoBackend, handle: FileHandle) {
    let id = handle.id();
    if let Err(e) = backend.close(handle) {
        tracing::warn!(handle = id, error = %e, "close failed");
    }
}

/// Reads `expected.len()` bytes at `offset` through a fresh buffered handle
/// and returns the index of the first byte that differs, if any.
fn verify(
    backend: &dyn IoBackend,
    path: &Path,
    offset: u64,
    expected: &[u8],
) -> Result<Option<usize>, IoError> {
    let started = Instant::now();
    let handle = backend.open(path, OpenFlags::read_only())?;
    let mut actual = vec![0u8; expected.len()];
    let mut filled = 0;

    while filled < actual.len() {
        match backend.read_at(&handle, offset + filled as u64, &mut actual[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.is_interrupted() => {}
            Err(e) => {
                close_quietly(backend, handle);
                return Err(e);
            }
        }
    }
    close_quietly(backend, handle);

    let mismatch = expected
        .iter()
        .zip(&actual[..filled])
        .position(|(a, b)| a != b)
        .or_else(|| (filled < expected.len()).then_some(filled));

    tracing::debug!(
        path = %path.display(),
        offset,
        length = expected.len(),
        ok = mismatch.is_none(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "validated transfer"
    );
    Ok(mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvswap_io::{BufferManager, SharedBuffer, SyncBackend, perform};
    use std::io;

    fn settings() -> TransferSettings {
        TransferSettings {
            alignment: 4096,
            block_size: 4096,
            direct_io: false,
            validate: false,
            max_retries: 2,
        }
    }

    fn write_desc(manager: &BufferManager, path: &Path, len: usize) -> (OperationDescriptor, SharedBuffer) {
        let buf = manager.allocate(len, 4096).unwrap();
        buf.copy_from_slice(&vec![0x5a; len]).unwrap();
        let desc = OperationDescriptor::new(
            OpId::new(1),
            Direction::Write,
            path.to_path_buf(),
            0,
            len,
            buf.lease().unwrap(),
        );
        (desc, buf)
    }

    /// Drives a transfer by running each request inline, replacing the
    /// result of the `n`th request with `fault(n)` when it returns one.
    fn drive(
        backend: &dyn IoBackend,
        mut step: Step,
        fault: impl Fn(usize) -> Option<Result<usize, IoError>>,
    ) -> (Finished, usize) {
        let mut requests = 0;
        loop {
            match step {
                Step::Done(finished) => return (finished, requests),
                Step::Submit(transfer, request) => {
                    let result = fault(requests).unwrap_or_else(|| perform(backend, &request));
                    requests += 1;
                    step = transfer.resume(backend, IoCompletion { request, result });
                }
            }
        }
    }

    #[test]
    fn requests_follow_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.bin");
        let backend = SyncBackend::new();
        let manager = BufferManager::default();
        let (desc, buf) = write_desc(&manager, &path, 3 * 4096);

        let step = Transfer::start(&backend, &settings(), desc);
        let (finished, requests) = drive(&backend, step, |_| None);

        assert_eq!(requests, 3);
        assert_eq!(finished.result.unwrap().bytes, 3 * 4096);
        drop(finished.lease);
        assert!(!buf.is_busy());
        assert_eq!(std::fs::read(&path).unwrap(), vec![0x5a; 3 * 4096]);
    }

    #[test]
    fn short_completion_resubmits_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let backend = SyncBackend::new();
        let manager = BufferManager::default();
        let (desc, _buf) = write_desc(&manager, &path, 4096);

        let Step::Submit(transfer, request) = Transfer::start(&backend, &settings(), desc) else {
            panic!("expected a request");
        };
        // The device took only the first half.
        let first = {
            let data = request.lease.data();
            backend.write_at(&request.file, 0, &data.as_slice()[..2048])
        };
        let Step::Submit(transfer, rest) = transfer.resume(&backend, IoCompletion { request, result: first }) else {
            panic!("expected the remainder");
        };
        assert_eq!(rest.position, 2048);
        assert_eq!(rest.range, 2048..4096);
        assert_eq!(transfer.done(), 2048);

        let (finished, _) = drive(&backend, Step::Submit(transfer, rest), |_| None);
        assert_eq!(finished.result.unwrap().bytes, 4096);
    }

    #[test]
    fn exhausted_retries_report_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eagain.bin");
        let backend = SyncBackend::new();
        let manager = BufferManager::default();
        let (desc, _buf) = write_desc(&manager, &path, 8192);

        let step = Transfer::start(&backend, &settings(), desc);
        let (finished, requests) = drive(&backend, step, |n| {
            (n >= 1).then(|| Err(io::Error::from(io::ErrorKind::WouldBlock).into()))
        });

        // One good block, then the first attempt and two retries of the second.
        assert_eq!(requests, 4);
        let err = finished.result.unwrap_err();
        assert_eq!(err.transferred, 4096);
        assert!(matches!(err.kind, TransferErrorKind::Os { .. }));
    }

    #[test]
    fn panicked_request_fails_as_worker_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panic.bin");
        let backend = SyncBackend::new();
        let manager = BufferManager::default();
        let (desc, _buf) = write_desc(&manager, &path, 4096);

        let step = Transfer::start(&backend, &settings(), desc);
        let (finished, _) = drive(&backend, step, |_| Some(Err(IoError::Panicked { operation: "write" })));
        assert_eq!(finished.result.unwrap_err().kind, TransferErrorKind::WorkerPanic);
    }

    #[test]
    fn open_failure_finishes_without_requests() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyncBackend::new();
        let manager = BufferManager::default();
        let buf = manager.allocate(4096, 4096).unwrap();
        let desc = OperationDescriptor::new(
            OpId::new(9),
            Direction::Read,
            dir.path().join("absent.bin"),
            0,
            4096,
            buf.lease().unwrap(),
        );

        let Step::Done(finished) = Transfer::start(&backend, &settings(), desc) else {
            panic!("open of a missing file must fail");
        };
        assert_eq!(finished.op, OpId::new(9));
        assert_eq!(finished.result.unwrap_err().transferred, 0);
    }
}
