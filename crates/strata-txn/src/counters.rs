//! Monotonic storage counters, pulled by the observability surface.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters bumped on the transaction paths.
#[derive(Debug, Default)]
pub struct Counters {
    /// WAL frames appended.
    pub frames_written: AtomicU64,
    /// Rollback-journal pre-image records appended.
    pub journal_pages_written: AtomicU64,
    /// Transactions committed.
    pub commits: AtomicU64,
    /// Transactions rolled back.
    pub rollbacks: AtomicU64,
    /// Savepoints created.
    pub savepoints: AtomicU64,
    /// Deadlock victims aborted.
    pub deadlocks: AtomicU64,
}

impl Counters {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Consistent snapshot for the pull interface.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            journal_pages_written: self.journal_pages_written.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            savepoints: self.savepoints.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CounterSnapshot {
    pub frames_written: u64,
    pub journal_pages_written: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub savepoints: u64,
    pub deadlocks: u64,
}
