//! Worker threads.
//!
//! Each worker owns one submission context ([`IoQueue`]) and keeps up to
//! `window` operations in flight on it. With overlapped events the window
//! refills as soon as any operation completes and every completion is
//! published as it is reaped. Without them a worker takes a batch, hands it
//! to the device, and publishes the whole batch once the last one is done.
//!
//! Publishing always releases the buffer lease first, then frees the queue
//! slot, then wakes waiters; a caller that sees a completion can therefore
//! reuse the buffer immediately.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use nvswap_io::{BlockingQueue, IoBackend, IoError, IoQueue};

use crate::completion::CompletionTracker;
use crate::descriptor::OperationDescriptor;
use crate::error::EngineError;
use crate::queue::SubmissionQueue;
use crate::stats::HandleStats;
use crate::transfer::{Finished, Origin, Step, Transfer, TransferSettings};

/// State shared between a handle and its workers.
pub(crate) struct Shared {
    pub(crate) handle_id: u64,
    pub(crate) queue: SubmissionQueue,
    pub(crate) tracker: CompletionTracker,
    pub(crate) stats: HandleStats,
    pub(crate) backend: Arc<dyn IoBackend>,
    pub(crate) settings: TransferSettings,
    /// Operations one worker keeps in flight.
    pub(crate) window: usize,
    /// Enter the device once per request instead of once per batch.
    pub(crate) single_submit: bool,
    /// Refill and publish per operation instead of per batch.
    pub(crate) overlap_events: bool,
}

impl Shared {
    /// Finishes an operation with a result that did not come from a worker.
    pub(crate) fn abandon(&self, desc: OperationDescriptor) {
        let op = desc.id;
        drop(desc);
        self.queue.finish(&[op]);
        self.stats.record_abandon();
        self.tracker.complete(op, Err(EngineError::Shutdown { op }));
    }
}

pub(crate) struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers over `shared`.
    ///
    /// If a spawn fails, the workers already started are stopped and joined
    /// before the error is returned.
    pub(crate) fn start(shared: &Arc<Shared>, threads: usize) -> Result<Self, EngineError> {
        let mut handles = Vec::with_capacity(threads);

        for worker in 0..threads {
            let state = Arc::clone(shared);
            let spawned = thread::Builder::new()
                .name(format!("nvswap-{}-worker-{worker}", shared.handle_id))
                .spawn(move || worker_loop(&state, worker));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shared.queue.stop();
                    Self { handles }.join();
                    return Err(EngineError::Spawn(e));
                }
            }
        }

        Ok(Self { handles })
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Joins every worker. The queue must already be stopped.
    pub(crate) fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                tracing::error!(worker = ?name, "worker thread panicked outside a transfer");
            }
        }
    }
}

/// Transfers waiting on the device, keyed by request tag.
type Active = HashMap<u64, Transfer>;

fn open_device(shared: &Shared, worker: usize) -> Box<dyn IoQueue> {
    nvswap_io::open_queue(&shared.backend, shared.window).unwrap_or_else(|e| {
        tracing::warn!(
            handle = shared.handle_id,
            worker,
            error = %e,
            "cannot open submission queue, running requests inline"
        );
        Box::new(BlockingQueue::inline(Arc::clone(&shared.backend)))
    })
}

fn worker_loop(shared: &Shared, worker: usize) {
    let mut device = open_device(shared, worker);
    let mut window = shared.window.min(device.depth()).max(1);
    tracing::debug!(
        handle = shared.handle_id,
        worker,
        queue = device.name(),
        window,
        "worker started"
    );

    let mut active = Active::with_capacity(window);
    let mut finished = Vec::new();

    loop {
        let batch = if active.is_empty() {
            match shared.queue.next_batch(window) {
                Some(batch) => batch,
                None => break,
            }
        } else if shared.overlap_events {
            shared.queue.try_batch(window.saturating_sub(active.len()))
        } else {
            Vec::new()
        };

        for desc in batch {
            let origin = Origin::of(&desc);
            let step = guarded(&origin, 0, || {
                Transfer::start(shared.backend.as_ref(), &shared.settings, desc)
            });
            launch(shared, device.as_mut(), &mut active, &mut finished, step);
        }
        device.submit();

        if !active.is_empty() {
            match device.reap(1) {
                Ok(completions) => {
                    for completion in completions {
                        let Some(transfer) = active.remove(&completion.request.tag) else {
                            tracing::error!(tag = completion.request.tag, "completion for unknown request");
                            continue;
                        };
                        let origin = transfer.origin().clone();
                        let done = transfer.done();
                        let step = guarded(&origin, done, || {
                            transfer.resume(shared.backend.as_ref(), completion)
                        });
                        launch(shared, device.as_mut(), &mut active, &mut finished, step);
                    }
                    device.submit();
                }
                Err(e) => {
                    tracing::error!(
                        handle = shared.handle_id,
                        worker,
                        queue = device.name(),
                        in_flight = active.len(),
                        error = %e,
                        "submission queue failed, failing its requests"
                    );
                    // Dropping the queue waits for the device and releases
                    // the leases its requests held.
                    device = Box::new(BlockingQueue::inline(Arc::clone(&shared.backend)));
                    window = 1;
                    finished.extend(active.drain().map(|(_, transfer)| transfer.lost(&e)));
                }
            }
        }

        if (shared.overlap_events || active.is_empty()) && !finished.is_empty() {
            publish(shared, std::mem::take(&mut finished));
        }
    }

    tracing::debug!(handle = shared.handle_id, worker, "worker stopped");
}

/// Queues the next request of a transfer, or records that it finished.
fn launch(
    shared: &Shared,
    device: &mut dyn IoQueue,
    active: &mut Active,
    finished: &mut Vec<Finished>,
    step: Step,
) {
    match step {
        Step::Done(done) => finished.push(done),
        Step::Submit(transfer, request) => {
            let tag = request.tag;
            match device.push(request) {
                Ok(()) => {
                    active.insert(tag, transfer);
                    if shared.single_submit {
                        device.submit();
                    }
                }
                Err(request) => {
                    // The window never exceeds the device depth, so a full
                    // device means it lost track of its slots.
                    drop(request);
                    let err = IoError::Unavailable {
                        facility: "submission queue",
                        hint: format!("{} refused a request with {} in flight", device.name(), active.len()),
                    };
                    tracing::error!(op = %transfer.origin().op, error = %err, "request not queued");
                    finished.push(transfer.lost(&err));
                }
            }
        }
    }
}

/// Runs one transfer step, turning a panic into a failed operation.
fn guarded(origin: &Origin, done: usize, step: impl FnOnce() -> Step) -> Step {
    panic::catch_unwind(AssertUnwindSafe(step)).unwrap_or_else(|_| {
        tracing::error!(op = %origin.op, path = %origin.path.display(), "transfer panicked");
        Step::Done(origin.panicked(done))
    })
}

fn publish(shared: &Shared, finished: Vec<Finished>) {
    let mut ids = Vec::with_capacity(finished.len());
    let mut results = Vec::with_capacity(finished.len());

    for Finished { op, lease, result } in finished {
        match &result {
            Ok(done) => {
                shared.stats.record_success(done.direction, done.bytes);
                tracing::debug!(
                    op = %done.op,
                    direction = %done.direction,
                    path = %done.path.display(),
                    offset = done.offset,
                    bytes = done.bytes,
                    direct = done.direct,
                    elapsed_us = done.elapsed.as_micros() as u64,
                    "operation completed"
                );
            }
            Err(e) => {
                shared.stats.record_failure();
                tracing::error!(op = %e.op, error = %e, "operation failed");
            }
        }
        // Releases the buffer lease.
        drop(lease);
        ids.push(op);
        results.push((op, result));
    }

    shared.queue.finish(&ids);
    for (op, result) in results {
        shared.tracker.complete(op, result.map_err(EngineError::from));
    }
}
