//! Batched submission with several requests in flight.
//!
//! An [`IoQueue`] is the per-thread submission context: requests are staged
//! with [`IoQueue::push`], handed to the device together by
//! [`IoQueue::submit`], and come back in completion order from
//! [`IoQueue::reap`]. Each request owns its file handle and its buffer lease
//! while it is in flight and returns both inside the [`IoCompletion`], so the
//! caller can resubmit the remainder of a short transfer without reopening
//! anything.
//!
//! Backends with a kernel completion interface provide their own queue
//! through [`IoBackend::io_queue`]. For the others [`BlockingQueue`] runs the
//! backend's positional calls on a small set of helper threads, one per
//! in-flight slot.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::backend::{FileHandle, IoBackend};
use crate::{BufferLease, IoError};

/// Direction of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// File to buffer.
    Read,
    /// Buffer to file.
    Write,
}

/// One positional transfer between a leased buffer range and a file.
#[derive(Debug)]
pub struct IoRequest {
    /// Caller-chosen identifier, returned unchanged with the completion.
    pub tag: u64,
    pub kind: IoKind,
    pub file: FileHandle,
    /// Byte position in the file.
    pub position: u64,
    pub lease: BufferLease,
    /// Bytes of the leased buffer to transfer.
    pub range: Range<usize>,
}

impl IoRequest {
    /// Returns the number of bytes requested.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Returns true if the request moves no bytes.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// A finished request together with its outcome.
#[derive(Debug)]
pub struct IoCompletion {
    pub request: IoRequest,
    /// Bytes transferred, which may be fewer than requested.
    pub result: Result<usize, IoError>,
}

/// Per-thread submission context.
pub trait IoQueue {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Maximum requests staged or in flight at once.
    fn depth(&self) -> usize;

    /// Requests staged or in flight and not yet reaped.
    fn outstanding(&self) -> usize;

    /// Stages a request for the next [`IoQueue::submit`].
    ///
    /// Hands the request back if the queue is already at its depth.
    fn push(&mut self, request: IoRequest) -> Result<(), IoRequest>;

    /// Hands every staged request to the device in one call and returns how
    /// many were submitted.
    fn submit(&mut self) -> usize;

    /// Waits until at least `min` requests have completed (fewer if fewer
    /// are outstanding) and returns every completion available.
    fn reap(&mut self, min: usize) -> Result<Vec<IoCompletion>, IoError>;
}

/// Runs one request as a blocking positional call.
pub fn perform(backend: &dyn IoBackend, request: &IoRequest) -> Result<usize, IoError> {
    let mut data = request.lease.data();
    let range = request.range.clone();
    match request.kind {
        IoKind::Read => backend.read_at(&request.file, request.position, &mut data.as_mut_slice()[range]),
        IoKind::Write => backend.write_at(&request.file, request.position, &data.as_slice()[range]),
    }
}

fn perform_guarded(backend: &dyn IoBackend, request: &IoRequest) -> Result<usize, IoError> {
    panic::catch_unwind(AssertUnwindSafe(|| perform(backend, request))).unwrap_or_else(|_| {
        tracing::error!(
            tag = request.tag,
            path = %request.file.path().display(),
            position = request.position,
            "backend panicked"
        );
        Err(IoError::Panicked {
            operation: match request.kind {
                IoKind::Read => "read",
                IoKind::Write => "write",
            },
        })
    })
}

/// Opens the best queue `backend` offers for `depth` in-flight requests.
pub fn open_queue(backend: &Arc<dyn IoBackend>, depth: usize) -> Result<Box<dyn IoQueue>, IoError> {
    match backend.io_queue(depth)? {
        Some(queue) => Ok(queue),
        None => Ok(Box::new(BlockingQueue::new(Arc::clone(backend), depth)?)),
    }
}

struct Helpers {
    jobs: Option<Sender<IoRequest>>,
    done: Receiver<IoCompletion>,
    threads: Vec<thread::JoinHandle<()>>,
}

/// Queue over a backend's blocking calls.
///
/// With a depth of one, requests run on the submitting thread during
/// [`IoQueue::submit`]. Deeper queues start one helper thread per slot so
/// that `depth` calls can block in the kernel at the same time.
pub struct BlockingQueue {
    backend: Arc<dyn IoBackend>,
    depth: usize,
    staged: Vec<IoRequest>,
    in_flight: usize,
    ready: VecDeque<IoCompletion>,
    helpers: Option<Helpers>,
}

impl BlockingQueue {
    /// Creates a queue for `depth` in-flight requests.
    pub fn new(backend: Arc<dyn IoBackend>, depth: usize) -> Result<Self, IoError> {
        if depth <= 1 {
            return Ok(Self::inline(backend));
        }
        let helpers = Self::spawn_helpers(&backend, depth)?;
        Ok(Self {
            backend,
            depth,
            staged: Vec::with_capacity(depth),
            in_flight: 0,
            ready: VecDeque::new(),
            helpers: Some(helpers),
        })
    }

    /// Creates a depth-one queue that runs each request on the submitting
    /// thread.
    pub fn inline(backend: Arc<dyn IoBackend>) -> Self {
        Self {
            backend,
            depth: 1,
            staged: Vec::with_capacity(1),
            in_flight: 0,
            ready: VecDeque::new(),
            helpers: None,
        }
    }

    fn spawn_helpers(backend: &Arc<dyn IoBackend>, depth: usize) -> Result<Helpers, IoError> {
        let (jobs, inbox) = mpsc::channel::<IoRequest>();
        let (finished, done) = mpsc::channel();
        let inbox = Arc::new(Mutex::new(inbox));
        let mut helpers = Helpers {
            jobs: Some(jobs),
            done,
            threads: Vec::with_capacity(depth),
        };

        for slot in 0..depth {
            let backend = Arc::clone(backend);
            let inbox = Arc::clone(&inbox);
            let finished = finished.clone();
            let spawned = thread::Builder::new()
                .name(format!("nvswap-aio-{slot}"))
                .spawn(move || helper_loop(backend.as_ref(), &inbox, &finished));
            match spawned {
                Ok(handle) => helpers.threads.push(handle),
                // Dropping `helpers` closes the job channel and joins the
                // threads already started.
                Err(e) => return Err(e.into()),
            }
        }
        Ok(helpers)
    }
}

fn helper_loop(backend: &dyn IoBackend, inbox: &Mutex<Receiver<IoRequest>>, finished: &Sender<IoCompletion>) {
    loop {
        let next = inbox.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(request) = next else {
            return;
        };
        let result = perform_guarded(backend, &request);
        if finished.send(IoCompletion { request, result }).is_err() {
            return;
        }
    }
}

impl IoQueue for BlockingQueue {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn outstanding(&self) -> usize {
        self.staged.len() + self.in_flight
    }

    fn push(&mut self, request: IoRequest) -> Result<(), IoRequest> {
        if self.outstanding() >= self.depth {
            return Err(request);
        }
        self.staged.push(request);
        Ok(())
    }

    fn submit(&mut self) -> usize {
        let submitted = self.staged.len();
        self.in_flight += submitted;

        for request in self.staged.drain(..) {
            let sender = self.helpers.as_ref().and_then(|h| h.jobs.as_ref());
            match sender {
                Some(jobs) => {
                    if let Err(mpsc::SendError(request)) = jobs.send(request) {
                        self.ready.push_back(IoCompletion {
                            request,
                            result: Err(IoError::Unavailable {
                                facility: "blocking queue",
                                hint: "helper threads exited".to_string(),
                            }),
                        });
                    }
                }
                None => {
                    let result = perform_guarded(self.backend.as_ref(), &request);
                    self.ready.push_back(IoCompletion { request, result });
                }
            }
        }
        submitted
    }

    fn reap(&mut self, min: usize) -> Result<Vec<IoCompletion>, IoError> {
        let want = min.min(self.in_flight);
        let mut out: Vec<_> = self.ready.drain(..).collect();

        if let Some(helpers) = &self.helpers {
            while out.len() < want {
                match helpers.done.recv() {
                    Ok(completion) => out.push(completion),
                    Err(_) => {
                        return Err(IoError::Unavailable {
                            facility: "blocking queue",
                            hint: "helper threads exited".to_string(),
                        });
                    }
                }
            }
            out.extend(helpers.done.try_iter());
        }

        self.in_flight -= out.len();
        Ok(out)
    }
}

impl Drop for Helpers {
    fn drop(&mut self) {
        drop(self.jobs.take());
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for BlockingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("backend", &self.backend.name())
            .field("depth", &self.depth)
            .field("staged", &self.staged.len())
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BufferManager, OpenFlags, SharedBuffer, SyncBackend};
    use std::time::{Duration, Instant};

    /// Sleeps before every call so overlap shows up in wall time.
    struct SlowBackend {
        inner: SyncBackend,
        delay: Duration,
    }

    impl IoBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn check_available(&self) -> Result<(), IoError> {
            Ok(())
        }
        fn open(&self, path: &std::path::Path, flags: OpenFlags) -> Result<FileHandle, IoError> {
            self.inner.open(path, flags)
        }
        fn read_at(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
            thread::sleep(self.delay);
            self.inner.read_at(handle, offset, buf)
        }
        fn write_at(&self, handle: &FileHandle, offset: u64, buf: &[u8]) -> Result<usize, IoError> {
            thread::sleep(self.delay);
            if buf.first() == Some(&0xee) {
                panic!("poisoned write");
            }
            self.inner.write_at(handle, offset, buf)
        }
        fn fsync(&self, handle: &FileHandle) -> Result<(), IoError> {
            self.inner.fsync(handle)
        }
        fn close(&self, handle: FileHandle) -> Result<(), IoError> {
            self.inner.close(handle)
        }
        fn file_size(&self, handle: &FileHandle) -> Result<u64, IoError> {
            self.inner.file_size(handle)
        }
    }

    fn slow(delay_ms: u64) -> Arc<dyn IoBackend> {
        Arc::new(SlowBackend {
            inner: SyncBackend::new(),
            delay: Duration::from_millis(delay_ms),
        })
    }

    fn write_request(
        backend: &Arc<dyn IoBackend>,
        manager: &BufferManager,
        path: &std::path::Path,
        tag: u64,
        byte: u8,
    ) -> (IoRequest, SharedBuffer) {
        let buf = manager.allocate(4096, 4096).unwrap();
        buf.copy_from_slice(&[byte; 4096]).unwrap();
        let request = IoRequest {
            tag,
            kind: IoKind::Write,
            file: backend.open(path, OpenFlags::write_create()).unwrap(),
            position: 0,
            lease: buf.lease().unwrap(),
            range: 0..4096,
        };
        (request, buf)
    }

    #[test]
    fn deep_queue_overlaps_blocking_calls() {
        let dir = tempfile::tempdir().unwrap();
        let backend = slow(100);
        let manager = BufferManager::default();
        let mut queue = BlockingQueue::new(Arc::clone(&backend), 4).unwrap();

        let mut buffers = Vec::new();
        for tag in 0..4u64 {
            let path = dir.path().join(format!("f{tag}"));
            let (request, buf) = write_request(&backend, &manager, &path, tag, tag as u8);
            queue.push(request).unwrap();
            buffers.push(buf);
        }

        let started = Instant::now();
        assert_eq!(queue.submit(), 4);
        let mut done = Vec::new();
        while done.len() < 4 {
            done.extend(queue.reap(1).unwrap());
        }
        assert!(started.elapsed() < Duration::from_millis(300), "calls ran serially");
        assert_eq!(queue.outstanding(), 0);

        let mut tags: Vec<_> = done.iter().map(|c| c.request.tag).collect();
        tags.sort_unstable();
        assert_eq!(tags, vec![0, 1, 2, 3]);
        assert!(done.iter().all(|c| matches!(c.result, Ok(4096))));

        drop(done);
        assert!(buffers.iter().all(|b| !b.is_busy()));
    }

    #[test]
    fn push_beyond_depth_hands_request_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = slow(0);
        let manager = BufferManager::default();
        let mut queue = BlockingQueue::new(Arc::clone(&backend), 1).unwrap();

        let (a, _buf_a) = write_request(&backend, &manager, &dir.path().join("a"), 1, 1);
        let (b, _buf_b) = write_request(&backend, &manager, &dir.path().join("b"), 2, 2);
        queue.push(a).unwrap();
        let back = queue.push(b).unwrap_err();
        assert_eq!(back.tag, 2);

        // Depth one runs inline at submit.
        assert_eq!(queue.submit(), 1);
        let done = queue.reap(1).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), vec![1u8; 4096]);
    }

    #[test]
    fn panicking_call_becomes_error_completion() {
        let dir = tempfile::tempdir().unwrap();
        let backend = slow(0);
        let manager = BufferManager::default();
        let mut queue = BlockingQueue::new(Arc::clone(&backend), 2).unwrap();

        let (request, buf) = write_request(&backend, &manager, &dir.path().join("p"), 7, 0xee);
        queue.push(request).unwrap();
        queue.submit();
        let done = queue.reap(1).unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].result.as_ref().is_err_and(IoError::is_panic));

        drop(done);
        assert!(!buf.is_busy());
    }
}
