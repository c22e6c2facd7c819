//! Per-handle counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::descriptor::Direction;

#[derive(Debug, Default)]
pub(crate) struct HandleStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    abandoned: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl HandleStats {
    pub(crate) fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes back a submission the queue rejected.
    pub(crate) fn unrecord_submit(&self) {
        self.submitted.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, direction: Direction, bytes: usize) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let counter = match direction {
            Direction::Read => &self.bytes_read,
            Direction::Write => &self.bytes_written,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandon(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a handle's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Operations accepted into the queue.
    pub submitted: u64,
    /// Operations that transferred every requested byte.
    pub completed: u64,
    /// Operations that finished with a transfer error.
    pub failed: u64,
    /// Operations removed by `cancel` before they started.
    pub cancelled: u64,
    /// Operations still queued when the handle shut down.
    pub abandoned: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl StatsSnapshot {
    /// Operations accepted and not yet accounted for.
    pub fn outstanding(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed + self.failed + self.cancelled + self.abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_add_up() {
        let stats = HandleStats::default();
        for _ in 0..5 {
            stats.record_submit();
        }
        stats.record_success(Direction::Write, 4096);
        stats.record_success(Direction::Read, 100);
        stats.record_failure();
        stats.record_cancel();

        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 5);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.bytes_written, 4096);
        assert_eq!(snap.bytes_read, 100);
        assert_eq!(snap.outstanding(), 1);
    }

    #[test]
    fn rejected_submission_is_taken_back() {
        let stats = HandleStats::default();
        stats.record_submit();
        stats.record_submit();
        stats.unrecord_submit();
        stats.record_success(Direction::Write, 1);

        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 1);
        assert_eq!(snap.outstanding(), 0);
    }
}
