//! Bounded FIFO submission queue with backpressure.
//!
//! The queue is the hand-off point between submitting threads and workers.
//! It is guarded by one mutex with three condition variables:
//!
//! - `not_full`: submitters wait here while `capacity` operations are
//!   outstanding (queued or executing, not yet finished).
//! - `work`: idle workers wait here for something they are allowed to take.
//! - `idle`: `close` waits here for the outstanding count to reach zero.
//!
//! # Ordering
//!
//! Operations leave the queue strictly in submission order. An operation is
//! only taken if it does not conflict with any operation still in flight
//! (same file, overlapping bytes, at least one write), including ones the
//! taking worker itself has in flight. A batch stops at the first conflict
//! rather than skipping ahead, so overlapping writes land in the order they
//! were submitted even when a worker keeps several operations in flight.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::descriptor::{Footprint, OpId, OperationDescriptor};

/// Why a push did not enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    /// The queue no longer accepts operations.
    Closed,
    /// No slot freed up within the timeout.
    Full { waited: Duration },
}

#[derive(Debug)]
struct InFlight {
    id: OpId,
    footprint: Footprint,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<OperationDescriptor>,
    in_flight: Vec<InFlight>,
    accepting: bool,
    stopping: bool,
}

impl QueueState {
    fn outstanding(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    fn blocked(&self, footprint: &Footprint) -> bool {
        self.in_flight
            .iter()
            .any(|f| f.footprint.conflicts_with(footprint))
    }

    /// Moves up to `max` runnable operations from the head to `in_flight`.
    fn take(&mut self, max: usize) -> Vec<OperationDescriptor> {
        let mut batch = Vec::with_capacity(max.min(self.pending.len()));
        while batch.len() < max {
            match self.pending.front() {
                Some(next) if !self.blocked(&next.footprint) => {}
                _ => break,
            }
            let Some(desc) = self.pending.pop_front() else {
                break;
            };
            self.in_flight.push(InFlight {
                id: desc.id,
                footprint: desc.footprint.clone(),
            });
            batch.push(desc);
        }
        batch
    }
}

#[derive(Debug)]
pub(crate) struct SubmissionQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    not_full: Condvar,
    work: Condvar,
    idle: Condvar,
}

impl SubmissionQueue {
    /// Creates a queue that admits at most `capacity` outstanding operations.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            capacity,
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(capacity),
                in_flight: Vec::with_capacity(capacity),
                accepting: true,
                stopping: false,
            }),
            not_full: Condvar::new(),
            work: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Operations queued or executing.
    pub(crate) fn outstanding(&self) -> usize {
        self.lock().outstanding()
    }

    /// Operations queued and not yet taken by a worker.
    pub(crate) fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Enqueues at the tail, blocking while the queue is at capacity.
    ///
    /// With `timeout` set, gives up after that long. A rejected descriptor is
    /// dropped, which releases its buffer lease.
    pub(crate) fn push(
        &self,
        desc: OperationDescriptor,
        timeout: Option<Duration>,
    ) -> Result<(), PushError> {
        let started = Instant::now();
        let mut state = self.lock();

        loop {
            if !state.accepting {
                return Err(PushError::Closed);
            }
            if state.outstanding() < self.capacity {
                state.pending.push_back(desc);
                self.work.notify_one();
                return Ok(());
            }

            state = match timeout {
                None => self
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(limit) => {
                    let waited = started.elapsed();
                    if waited >= limit {
                        return Err(PushError::Full { waited });
                    }
                    self.not_full
                        .wait_timeout(state, limit - waited)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Takes up to `max` operations from the head.
    ///
    /// Blocks until the head may run. Returns `None` once the queue is
    /// stopping and nothing is left to run. The caller must have nothing in
    /// flight itself, or a head that conflicts with its own work would never
    /// unblock.
    pub(crate) fn next_batch(&self, max: usize) -> Option<Vec<OperationDescriptor>> {
        let max = max.max(1);
        let mut state = self.lock();

        loop {
            let batch = state.take(max);
            if !batch.is_empty() {
                if !state.pending.is_empty() {
                    self.work.notify_one();
                }
                return Some(batch);
            }
            if state.stopping && state.pending.is_empty() {
                return None;
            }
            state = self.work.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Takes up to `max` operations from the head without waiting.
    pub(crate) fn try_batch(&self, max: usize) -> Vec<OperationDescriptor> {
        if max == 0 {
            return Vec::new();
        }
        self.lock().take(max)
    }

    /// Marks operations as finished, freeing their slots and unblocking any
    /// queued operation that conflicted with them.
    pub(crate) fn finish(&self, ids: &[OpId]) {
        let mut state = self.lock();
        state.in_flight.retain(|f| !ids.contains(&f.id));
        self.after_removal(&state);
    }

    /// Removes an operation that no worker has taken yet.
    pub(crate) fn cancel(&self, id: OpId) -> Option<OperationDescriptor> {
        let mut state = self.lock();
        let index = state.pending.iter().position(|d| d.id == id)?;
        let desc = state.pending.remove(index);
        self.after_removal(&state);
        desc
    }

    /// Removes every operation no worker has taken yet.
    pub(crate) fn drain_pending(&self) -> Vec<OperationDescriptor> {
        let mut state = self.lock();
        let drained: Vec<_> = state.pending.drain(..).collect();
        self.after_removal(&state);
        drained
    }

    /// Stops accepting new operations. Queued ones still run.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.accepting = false;
        // Wake blocked submitters so they observe the closed queue.
        self.not_full.notify_all();
    }

    /// Blocks until no operation is queued or executing.
    pub(crate) fn wait_idle(&self) {
        let mut state = self.lock();
        while state.outstanding() > 0 {
            state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Tells workers to exit once the queue is empty.
    pub(crate) fn stop(&self) {
        let mut state = self.lock();
        state.accepting = false;
        state.stopping = true;
        self.work.notify_all();
        self.not_full.notify_all();
    }

    fn after_removal(&self, state: &QueueState) {
        self.work.notify_all();
        self.not_full.notify_all();
        if state.outstanding() == 0 {
            self.idle.notify_all();
        }
    }
}
