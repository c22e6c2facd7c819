//! Kernel completion-ring backend.
//!
//! [`UringBackend`] opens and closes files like [`SyncBackend`] but moves
//! data through an io_uring instance per submitting thread: a whole batch
//! of reads and writes enters the kernel in one `io_uring_enter(2)` and
//! completions are reaped in the order the device finishes them.
//!
//! Kernels without io_uring (or sandboxes that filter `io_uring_setup`)
//! make [`UringBackend::check_available`] fail, so an engine configured
//! for it refuses to start rather than falling back silently.

#![allow(unsafe_code)]

use std::path::Path;

use crate::aio::IoQueue;
use crate::backend::{FileHandle, IoBackend, OpenFlags};
use crate::{IoError, SyncBackend};

/// Backend that submits transfers through io_uring.
#[derive(Debug, Default)]
pub struct UringBackend {
    posix: SyncBackend,
}

impl UringBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IoBackend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    #[cfg(target_os = "linux")]
    fn check_available(&self) -> Result<(), IoError> {
        io_uring::IoUring::new(2)
            .map(drop)
            .map_err(|e| IoError::Unavailable {
                facility: "io_uring",
                hint: format!("io_uring_setup failed ({e}); needs Linux 5.6 or later"),
            })?;
        self.posix.check_available()
    }

    #[cfg(not(target_os = "linux"))]
    fn check_available(&self) -> Result<(), IoError> {
        Err(IoError::Unavailable {
            facility: "io_uring",
            hint: "io_uring is only available on Linux".to_string(),
        })
    }

    #[cfg(target_os = "linux")]
    fn io_queue(&self, depth: usize) -> Result<Option<Box<dyn IoQueue>>, IoError> {
        Ok(Some(Box::new(linux::UringQueue::new(depth)?)))
    }

    #[cfg(not(target_os = "linux"))]
    fn io_queue(&self, _depth: usize) -> Result<Option<Box<dyn IoQueue>>, IoError> {
        self.check_available().map(|()| None)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, IoError> {
        self.posix.open(path, flags)
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

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::os::fd::AsRawFd;

    use io_uring::{IoUring, opcode, types};

    use crate::IoError;
    use crate::aio::{IoCompletion, IoKind, IoQueue, IoRequest};

    /// One ring, owned by one submitting thread.
    ///
    /// Requests stay in `slots` from push until their completion is reaped;
    /// the slot index is the entry's `user_data`. Holding the request keeps
    /// its buffer lease, and so the memory the kernel reads or writes,
    /// alive and exclusively claimed for as long as the kernel may use it.
    pub(super) struct UringQueue {
        ring: IoUring,
        depth: usize,
        slots: Vec<Option<IoRequest>>,
        free: Vec<usize>,
        staged: usize,
        queued: usize,
        ready: Vec<IoCompletion>,
    }

    impl UringQueue {
        pub(super) fn new(depth: usize) -> Result<Self, IoError> {
            let depth = depth.max(1);
            let ring = IoUring::new(depth as u32)?;
            Ok(Self {
                ring,
                depth,
                slots: (0..depth).map(|_| None).collect(),
                free: (0..depth).rev().collect(),
                staged: 0,
                queued: 0,
                ready: Vec::new(),
            })
        }

        fn collect(&mut self, out: &mut Vec<IoCompletion>) {
            let finished: Vec<(u64, i32)> = self
                .ring
                .completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect();

            for (slot, res) in finished {
                let slot = slot as usize;
                let Some(request) = self.slots.get_mut(slot).and_then(Option::take) else {
                    tracing::warn!(slot, "completion for an empty slot");
                    continue;
                };
                self.free.push(slot);
                self.queued -= 1;
                let result = if res < 0 {
                    Err(io::Error::from_raw_os_error(-res).into())
                } else {
                    Ok(res as usize)
                };
                out.push(IoCompletion { request, result });
            }
        }
    }

    impl IoQueue for UringQueue {
        fn name(&self) -> &'static str {
            "io_uring"
        }

        fn depth(&self) -> usize {
            self.depth
        }

        fn outstanding(&self) -> usize {
            self.queued + self.ready.len()
        }

        fn push(&mut self, request: IoRequest) -> Result<(), IoRequest> {
            if self.outstanding() >= self.depth {
                return Err(request);
            }
            let Some(slot) = self.free.pop() else {
                return Err(request);
            };
            let fd = match request.file.file() {
                Ok(file) => types::Fd(file.as_raw_fd()),
                Err(e) => {
                    self.free.push(slot);
                    self.ready.push(IoCompletion {
                        request,
                        result: Err(e),
                    });
                    return Ok(());
                }
            };

            let len = u32::try_from(request.len()).unwrap_or(u32::MAX);
            let range = request.range.clone();
            let entry = match request.kind {
                IoKind::Read => {
                    let ptr = request.lease.data().as_mut_slice()[range].as_mut_ptr();
                    opcode::Read::new(fd, ptr, len).offset(request.position).build()
                }
                IoKind::Write => {
                    let ptr = request.lease.data().as_slice()[range].as_ptr();
                    opcode::Write::new(fd, ptr, len).offset(request.position).build()
                }
            }
            .user_data(slot as u64);

            // SAFETY: The entry points into the leased buffer and at an open
            // descriptor owned by `request`. Both are kept in `slots[slot]`
            // until the matching completion is reaped, and `Drop` waits for
            // every queued entry before the slots are released.
            let pushed = unsafe { self.ring.submission().push(&entry) };
            if pushed.is_err() {
                self.free.push(slot);
                return Err(request);
            }

            self.slots[slot] = Some(request);
            self.staged += 1;
            self.queued += 1;
            Ok(())
        }

        fn submit(&mut self) -> usize {
            let staged = std::mem::take(&mut self.staged);
            if staged > 0 {
                // Entries left in the ring on error go in with the next enter.
                if let Err(e) = self.ring.submit() {
                    tracing::warn!(error = %e, staged, "io_uring submit failed, deferring to reap");
                }
            }
            staged
        }

        fn reap(&mut self, min: usize) -> Result<Vec<IoCompletion>, IoError> {
            let mut out = std::mem::take(&mut self.ready);
            let want = min.min(out.len() + self.queued).saturating_sub(out.len());

            if want > 0 {
                loop {
                    match self.ring.submit_and_wait(want) {
                        Ok(_) => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            self.ready = out;
                            return Err(e.into());
                        }
                    }
                }
                self.staged = 0;
            }

            self.collect(&mut out);
            Ok(out)
        }
    }

    impl Drop for UringQueue {
        fn drop(&mut self) {
            while self.queued > 0 {
                match self.ring.submit_and_wait(self.queued) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::error!(error = %e, queued = self.queued, "cannot drain io_uring; leaking buffers");
                        std::mem::forget(std::mem::take(&mut self.slots));
                        return;
                    }
                }
                let mut discarded = Vec::new();
                self.collect(&mut discarded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio::{IoKind, IoRequest, open_queue};
    use crate::BufferManager;
    use std::sync::Arc;

    #[test]
    fn batch_round_trip_through_ring() {
        let backend: Arc<dyn IoBackend> = Arc::new(UringBackend::new());
        if backend.check_available().is_err() {
            // Kernel or sandbox without io_uring.
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.bin");
        let manager = BufferManager::default();
        let mut queue = open_queue(&backend, 4).unwrap();
        assert_eq!(queue.name(), "io_uring");

        let mut buffers = Vec::new();
        for block in 0..4u64 {
            let buf = manager.allocate(4096, 4096).unwrap();
            buf.copy_from_slice(&[block as u8 + 1; 4096]).unwrap();
            queue
                .push(IoRequest {
                    tag: block,
                    kind: IoKind::Write,
                    file: backend.open(&path, OpenFlags::write_create()).unwrap(),
                    position: block * 4096,
                    lease: buf.lease().unwrap(),
                    range: 0..4096,
                })
                .unwrap();
            buffers.push(buf);
        }
        assert_eq!(queue.submit(), 4);

        let mut done = Vec::new();
        while done.len() < 4 {
            done.extend(queue.reap(1).unwrap());
        }
        assert!(done.iter().all(|c| matches!(c.result, Ok(4096))));
        drop(done);

        let data = std::fs::read(&path).unwrap();
        for (i, block) in data.chunks(4096).enumerate() {
            assert!(block.iter().all(|&b| b == i as u8 + 1));
        }
        assert!(buffers.iter().all(|b| !b.is_busy()));
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn unavailable_off_linux() {
        assert!(matches!(
            UringBackend::new().check_available(),
            Err(IoError::Unavailable { facility: "io_uring", .. })
        ));
    }
}
