//! Completion tracking.
//!
//! Every accepted operation gets a slot keyed by its [`OpId`]. Workers fill
//! the slot exactly once; the caller consumes it exactly once through the
//! [`Token`] returned at submission.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::descriptor::{Completion, OpId};
use crate::error::EngineError;

/// Outcome of one operation.
pub type OpResult = Result<Completion, EngineError>;

/// Claim on the result of one submitted operation.
///
/// A token is consumed by [`wait`](crate::EngineHandle::wait), by a
/// [`poll`](crate::EngineHandle::poll) that finds the result ready, or by
/// [`cancel`](crate::EngineHandle::cancel). It cannot be cloned, so each
/// result is handed out once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "the result of a submitted operation is only available through its token"]
pub struct Token {
    op: OpId,
    handle: u64,
}

impl Token {
    /// Returns the operation this token refers to.
    pub fn op(&self) -> OpId {
        self.op
    }
}

/// Result of a non-blocking completion check.
#[derive(Debug)]
pub enum PollOutcome {
    /// The operation finished; the token has been consumed.
    Ready(OpResult),
    /// The operation is still queued or executing; the token is handed back.
    Pending(Token),
}

impl PollOutcome {
    /// Returns true if the operation finished.
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }
}

#[derive(Debug)]
enum Slot {
    Pending,
    Ready(OpResult),
}

#[derive(Debug)]
pub(crate) struct CompletionTracker {
    handle: u64,
    slots: Mutex<HashMap<OpId, Slot>>,
    ready: Condvar,
}

impl CompletionTracker {
    pub(crate) fn new(handle: u64) -> Self {
        Self {
            handle,
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OpId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, token: &Token) -> Result<(), EngineError> {
        if token.handle == self.handle {
            Ok(())
        } else {
            Err(EngineError::InvalidToken { op: token.op })
        }
    }

    /// Opens a pending slot and returns the token for it.
    pub(crate) fn register(&self, op: OpId) -> Token {
        self.lock().insert(op, Slot::Pending);
        Token {
            op,
            handle: self.handle,
        }
    }

    /// Drops a slot whose operation never reached a worker.
    ///
    /// Wakes waiters, since a `wait_all` may be blocked on nothing else.
    pub(crate) fn discard(&self, token: Token) {
        self.lock().remove(&token.op);
        self.ready.notify_all();
    }

    /// Publishes the result of an operation and wakes waiters.
    pub(crate) fn complete(&self, op: OpId, result: OpResult) {
        let mut slots = self.lock();
        match slots.get_mut(&op) {
            Some(slot @ Slot::Pending) => *slot = Slot::Ready(result),
            Some(Slot::Ready(_)) => {
                tracing::error!(%op, "operation completed twice; keeping first result");
                return;
            }
            None => {
                tracing::error!(%op, "completion for unregistered operation");
                return;
            }
        }
        drop(slots);
        self.ready.notify_all();
    }

    /// Blocks until the operation finishes and returns its result.
    pub(crate) fn wait(&self, token: Token) -> OpResult {
        self.check(&token)?;
        let mut slots = self.lock();
        loop {
            match slots.get(&token.op) {
                None => return Err(EngineError::InvalidToken { op: token.op }),
                Some(Slot::Ready(_)) => {
                    return match slots.remove(&token.op) {
                        Some(Slot::Ready(result)) => result,
                        _ => Err(EngineError::InvalidToken { op: token.op }),
                    };
                }
                Some(Slot::Pending) => {}
            }
            slots = self.ready.wait(slots).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns the result if the operation already finished.
    pub(crate) fn poll(&self, token: Token) -> PollOutcome {
        if let Err(e) = self.check(&token) {
            return PollOutcome::Ready(Err(e));
        }
        let mut slots = self.lock();
        match slots.get(&token.op) {
            Some(Slot::Pending) => PollOutcome::Pending(token),
            Some(Slot::Ready(_)) => match slots.remove(&token.op) {
                Some(Slot::Ready(result)) => PollOutcome::Ready(result),
                _ => PollOutcome::Ready(Err(EngineError::InvalidToken { op: token.op })),
            },
            None => PollOutcome::Ready(Err(EngineError::InvalidToken { op: token.op })),
        }
    }

    /// Identifiers of every registered operation, in submission order.
    pub(crate) fn snapshot(&self) -> Vec<OpId> {
        let mut ids: Vec<OpId> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Waits until every operation in `ids` has finished and takes their
    /// results. Results claimed concurrently through a token are skipped.
    pub(crate) fn wait_for(&self, ids: Vec<OpId>) -> Vec<(OpId, OpResult)> {
        let mut slots = self.lock();
        while ids
            .iter()
            .any(|id| matches!(slots.get(id), Some(Slot::Pending)))
        {
            slots = self.ready.wait(slots).unwrap_or_else(PoisonError::into_inner);
        }

        ids.into_iter()
            .filter_map(|id| match slots.remove(&id) {
                Some(Slot::Ready(result)) => Some((id, result)),
                _ => None,
            })
            .collect()
    }

    /// Waits for every operation registered when the call starts and takes
    /// all their results, in submission order.
    #[cfg(test)]
    pub(crate) fn wait_all(&self) -> Vec<(OpId, OpResult)> {
        self.wait_for(self.snapshot())
    }

    /// Operations registered and not yet finished.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Pending))
            .count()
    }

    /// Results published and not yet consumed.
    pub(crate) fn unclaimed(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Direction;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn done(op: OpId) -> OpResult {
        Ok(Completion {
            op,
            direction: Direction::Write,
            path: PathBuf::from("/f"),
            offset: 0,
            bytes: 4096,
            direct: false,
            elapsed: Duration::ZERO,
        })
    }

    #[test]
    fn wait_consumes_once() {
        let tracker = CompletionTracker::new(1);
        let token = tracker.register(OpId::new(7));
        tracker.complete(OpId::new(7), done(OpId::new(7)));

        let completion = tracker.wait(token).unwrap();
        assert_eq!(completion.op, OpId::new(7));
        assert_eq!(tracker.unclaimed(), 0);
    }

    #[test]
    fn second_completion_keeps_first_result() {
        let tracker = CompletionTracker::new(1);
        let op = OpId::new(3);
        let token = tracker.register(op);
        tracker.complete(op, done(op));
        tracker.complete(op, Err(EngineError::Shutdown { op }));
        tracker.complete(OpId::new(4), done(OpId::new(4)));

        assert!(tracker.wait(token).is_ok());
        assert_eq!(tracker.unclaimed(), 0);
    }

    #[test]
    fn wait_blocks_until_complete() {
        let tracker = Arc::new(CompletionTracker::new(1));
        let token = tracker.register(OpId::new(1));

        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.wait(token).map(|c| c.bytes))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        tracker.complete(OpId::new(1), done(OpId::new(1)));
        assert_eq!(waiter.join().unwrap().unwrap(), 4096);
    }

    #[test]
    fn poll_hands_token_back_while_pending() {
        let tracker = CompletionTracker::new(1);
        let token = tracker.register(OpId::new(3));

        let token = match tracker.poll(token) {
            PollOutcome::Pending(t) => t,
            PollOutcome::Ready(r) => panic!("unexpected result {r:?}"),
        };
        assert_eq!(token.op(), OpId::new(3));

        tracker.complete(OpId::new(3), done(OpId::new(3)));
        assert!(tracker.poll(token).is_ready());
    }

    #[test]
    fn foreign_token_is_rejected() {
        let a = CompletionTracker::new(1);
        let b = CompletionTracker::new(2);
        let token = a.register(OpId::new(1));
        b.register(OpId::new(1));
        b.complete(OpId::new(1), done(OpId::new(1)));

        let err = b.wait(token).unwrap_err();
        assert!(matches!(err, EngineError::InvalidToken { op } if op == OpId::new(1)));
    }

    #[test]
    fn wait_all_snapshots_and_orders() {
        let tracker = Arc::new(CompletionTracker::new(1));
        let tokens: Vec<_> = (0..4).map(|i| tracker.register(OpId::new(i))).collect();

        let finisher = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for i in (0..4).rev() {
                    thread::sleep(Duration::from_millis(5));
                    tracker.complete(OpId::new(i), done(OpId::new(i)));
                }
            })
        };

        let results = tracker.wait_all();
        finisher.join().unwrap();
        let ids: Vec<u64> = results.iter().map(|(id, _)| id.as_u64()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        // Tokens consumed by wait_all are no longer valid.
        for token in tokens {
            assert!(matches!(
                tracker.wait(token),
                Err(EngineError::InvalidToken { .. })
            ));
        }
    }

    #[test]
    fn wait_all_on_empty_returns_immediately() {
        let tracker = CompletionTracker::new(1);
        assert!(tracker.wait_all().is_empty());
    }

    #[test]
    fn discard_removes_slot() {
        let tracker = CompletionTracker::new(1);
        let token = tracker.register(OpId::new(9));
        assert_eq!(tracker.pending(), 1);
        tracker.discard(token);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn discard_wakes_blocked_wait_all() {
        let tracker = Arc::new(CompletionTracker::new(1));
        let _finished = tracker.register(OpId::new(0));
        let cancelled = tracker.register(OpId::new(1));
        tracker.complete(OpId::new(0), done(OpId::new(0)));

        let drainer = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || tracker.wait_all())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!drainer.is_finished(), "wait_all must wait for the queued op");

        tracker.discard(cancelled);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !drainer.is_finished() {
            assert!(std::time::Instant::now() < deadline, "wait_all stayed blocked after discard");
            thread::sleep(Duration::from_millis(1));
        }
        let results = drainer.join().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, OpId::new(0));
    }

    #[test]
    fn errors_are_delivered_through_token() {
        let tracker = CompletionTracker::new(1);
        let token = tracker.register(OpId::new(2));
        tracker.complete(OpId::new(2), Err(EngineError::Shutdown { op: OpId::new(2) }));
        assert!(matches!(
            tracker.wait(token),
            Err(EngineError::Shutdown { .. })
        ));
    }
}
