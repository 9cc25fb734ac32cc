//! Lock manager: the five-level ladder across transactions, with busy
//! backoff and wait-graph deadlock detection.
//!
//! Two layers of arbitration. Kernel byte-range locks (through the VFS
//! file handle) resolve conflicts with *other processes*; they cannot see
//! conflicts between transactions inside this process, because the VFS
//! coalesces all in-process handles onto one descriptor. The in-process
//! table here arbitrates between local transactions first, and only the
//! aggregate level is mirrored to the kernel.
//!
//! Ladder rules enforced locally: any number of `Shared`; at most one
//! `Reserved`; `Pending` blocks new `Shared`; `Exclusive` requires that no
//! other transaction holds even `Shared`. Within a transaction the held
//! level never decreases until release at commit/rollback.
//!
//! Contention returns `Busy`; [`LockManager::acquire_with_backoff`]
//! retries with exponential backoff under the busy timeout, registering a
//! wait-graph edge while it waits. On timeout the graph is walked; if a
//! cycle is proven, the youngest transaction in it is aborted with
//! `Deadlock`. The graph is per-process — deadlocks against other
//! processes fall back to the timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strata_error::{Result, StrataError};
use strata_types::cx::Cx;
use strata_types::limits::{BUSY_BACKOFF_BASE_MS, BUSY_BACKOFF_CAP_MS};
use strata_types::{LockLevel, TxnId};
use strata_vfs::VfsFile;
use tracing::{debug, warn};

/// Wait-graph bookkeeping: who waits on whom, and who has been chosen as
/// a deadlock victim.
#[derive(Debug, Default)]
struct WaitGraph {
    /// waiter → holders it is blocked behind.
    edges: HashMap<TxnId, Vec<TxnId>>,
    /// Transactions aborted by deadlock resolution; they observe it at
    /// their next lock operation.
    doomed: Vec<TxnId>,
}

impl WaitGraph {
    fn set_edges(&mut self, waiter: TxnId, holders: Vec<TxnId>) {
        if holders.is_empty() {
            self.edges.remove(&waiter);
        } else {
            self.edges.insert(waiter, holders);
        }
    }

    fn clear_waiter(&mut self, waiter: TxnId) {
        self.edges.remove(&waiter);
    }

    /// Find a cycle reachable from `start`. Worst case O(n²): a DFS from
    /// every node on the path.
    fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut path = vec![start];
        let mut stack = vec![(start, 0usize)];
        while let Some((node, next_edge)) = stack.pop() {
            let holders = match self.edges.get(&node) {
                Some(h) => h,
                None => {
                    path.pop();
                    continue;
                }
            };
            if next_edge >= holders.len() {
                path.pop();
                continue;
            }
            stack.push((node, next_edge + 1));
            let holder = holders[next_edge];
            if let Some(pos) = path.iter().position(|&t| t == holder) {
                return Some(path[pos..].to_vec());
            }
            path.push(holder);
            stack.push((holder, 0));
        }
        None
    }
}

/// Per-database lock arbitration.
pub struct LockManager {
    /// Dedicated handle for mirroring the aggregate level to the kernel.
    file: Mutex<Box<dyn VfsFile>>,
    /// In-process transaction lock levels.
    table: Mutex<HashMap<TxnId, LockLevel>>,
    graph: Mutex<WaitGraph>,
    busy_timeout: Duration,
}

impl LockManager {
    /// Wrap a dedicated file handle on the database.
    #[must_use]
    pub fn new(file: Box<dyn VfsFile>, busy_timeout: Duration) -> Self {
        Self {
            file: Mutex::new(file),
            table: Mutex::new(HashMap::new()),
            graph: Mutex::new(WaitGraph::default()),
            busy_timeout,
        }
    }

    /// The configured busy timeout.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    /// Level currently held by `txn`.
    #[must_use]
    pub fn level(&self, txn: TxnId) -> LockLevel {
        self.table
            .lock()
            .get(&txn)
            .copied()
            .unwrap_or(LockLevel::None)
    }

    /// Non-blocking acquire. Returns `Busy` on conflict, `Deadlock` if
    /// this transaction was picked as a deadlock victim.
    pub fn acquire(&self, cx: &Cx, txn: TxnId, level: LockLevel) -> Result<()> {
        cx.checkpoint()?;
        self.check_doomed(txn)?;

        let mut table = self.table.lock();
        let held = table.get(&txn).copied().unwrap_or(LockLevel::None);
        if held >= level {
            return Ok(());
        }

        let blockers = Self::conflicting_holders(&table, txn, level);
        if !blockers.is_empty() {
            drop(table);
            self.graph.lock().set_edges(txn, blockers);
            return Err(StrataError::Busy);
        }

        // Mirror the new process aggregate to the kernel. The table lock is
        // held across the (non-blocking) fcntl call so the aggregate cannot
        // drift underneath us.
        let aggregate_before = Self::aggregate(&table);
        let aggregate_after = aggregate_before.max(level);
        if aggregate_after > aggregate_before {
            let mut file = self.file.lock();
            if let Err(e) = file.lock(cx, aggregate_after) {
                drop(file);
                drop(table);
                if matches!(e, StrataError::Busy) {
                    // Foreign-process conflict: no wait edge to record.
                    return Err(StrataError::Busy);
                }
                return Err(e);
            }
        }

        table.insert(txn, level);
        drop(table);
        self.graph.lock().clear_waiter(txn);
        debug!(%txn, ?level, "lock acquired");
        Ok(())
    }

    /// Acquire with exponential backoff (base 1 ms, cap 100 ms) under the
    /// busy timeout, checking the cancellation token before every retry.
    /// Runs deadlock detection when the timeout expires.
    pub fn acquire_with_backoff(&self, cx: &Cx, txn: TxnId, level: LockLevel) -> Result<()> {
        let deadline = Instant::now() + self.busy_timeout;
        let mut delay = Duration::from_millis(BUSY_BACKOFF_BASE_MS);
        loop {
            match self.acquire(cx, txn, level) {
                Err(StrataError::Busy) => {}
                other => {
                    self.graph.lock().clear_waiter(txn);
                    return other;
                }
            }

            if Instant::now() >= deadline {
                let verdict = self.resolve_deadlock(txn);
                self.graph.lock().clear_waiter(txn);
                return Err(verdict);
            }

            cx.checkpoint().inspect_err(|_| {
                self.graph.lock().clear_waiter(txn);
            })?;
            std::thread::sleep(delay.min(deadline.saturating_duration_since(Instant::now())));
            delay = (delay * 2).min(Duration::from_millis(BUSY_BACKOFF_CAP_MS));
        }
    }

    /// Release every level held by `txn`.
    pub fn release(&self, cx: &Cx, txn: TxnId) -> Result<()> {
        let mut table = self.table.lock();
        if table.remove(&txn).is_none() {
            return Ok(());
        }
        let aggregate = Self::aggregate(&table);
        let mut file = self.file.lock();
        file.unlock(cx, aggregate)?;
        drop(file);
        drop(table);
        let mut graph = self.graph.lock();
        graph.clear_waiter(txn);
        graph.doomed.retain(|&t| t != txn);
        debug!(%txn, "locks released");
        Ok(())
    }

    /// Whether any transaction holds `Reserved` or higher.
    #[must_use]
    pub fn writer_active(&self) -> bool {
        self.table
            .lock()
            .values()
            .any(|&l| l >= LockLevel::Reserved)
    }

    /// Run `f` against the lock file handle (used by recovery to probe).
    pub fn with_file<R>(&self, f: impl FnOnce(&mut dyn VfsFile) -> Result<R>) -> Result<R> {
        let mut file = self.file.lock();
        f(file.as_mut())
    }

    /// Release the underlying file handle.
    pub fn close(&self, cx: &Cx) -> Result<()> {
        self.file.lock().close(cx)
    }

    fn check_doomed(&self, txn: TxnId) -> Result<()> {
        let mut graph = self.graph.lock();
        if let Some(pos) = graph.doomed.iter().position(|&t| t == txn) {
            graph.doomed.remove(pos);
            return Err(StrataError::Deadlock { victim: txn.0 });
        }
        Ok(())
    }

    /// Deadlock resolution on busy-timeout: walk the graph from `txn`; if
    /// a cycle is found, abort its youngest member (latest begin — ids are
    /// assigned monotonically at begin).
    fn resolve_deadlock(&self, txn: TxnId) -> StrataError {
        let mut graph = self.graph.lock();
        let Some(cycle) = graph.find_cycle(txn) else {
            return StrataError::Busy;
        };
        let victim = cycle.iter().copied().max().expect("cycle is non-empty");
        warn!(%txn, %victim, cycle = ?cycle, "deadlock cycle; aborting youngest");
        if victim == txn {
            StrataError::Deadlock { victim: victim.0 }
        } else {
            graph.doomed.push(victim);
            graph.clear_waiter(victim);
            // The victim will abort at its next lock operation; this waiter
            // reports Busy and may retry.
            StrataError::Busy
        }
    }

    /// Record a wait edge directly (used when a caller blocks on a
    /// resource tracked outside this table, e.g. a companion file).
    pub fn note_wait(&self, waiter: TxnId, holder: TxnId) {
        self.graph.lock().set_edges(waiter, vec![holder]);
    }

    /// Force a deadlock check for `txn` without waiting for its timeout.
    pub fn check_deadlock(&self, txn: TxnId) -> Result<()> {
        match self.resolve_deadlock(txn) {
            StrataError::Deadlock { victim } if victim == txn.0 => {
                Err(StrataError::Deadlock { victim })
            }
            _ => Ok(()),
        }
    }

    fn aggregate(table: &HashMap<TxnId, LockLevel>) -> LockLevel {
        table.values().copied().max().unwrap_or(LockLevel::None)
    }

    /// Holders that block `txn` from taking `level` under the ladder rules.
    fn conflicting_holders(
        table: &HashMap<TxnId, LockLevel>,
        txn: TxnId,
        level: LockLevel,
    ) -> Vec<TxnId> {
        table
            .iter()
            .filter(|(other, _)| **other != txn)
            .filter(|(_, &held)| match level {
                LockLevel::None => false,
                LockLevel::Shared => held >= LockLevel::Pending,
                LockLevel::Reserved | LockLevel::Pending => held >= LockLevel::Reserved,
                LockLevel::Exclusive => held >= LockLevel::Shared,
            })
            .map(|(other, _)| *other)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use strata_types::flags::VfsOpenFlags;
    use strata_vfs::{MemoryVfs, Vfs};

    fn manager(vfs: &MemoryVfs, name: &str, timeout_ms: u64) -> LockManager {
        let cx = Cx::new();
        let file = vfs
            .open(
                &cx,
                Path::new(name),
                VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE,
            )
            .unwrap();
        LockManager::new(file, Duration::from_millis(timeout_ms))
    }

    #[test]
    fn many_shared_one_reserved() {
        let vfs = MemoryVfs::new();
        let locks = manager(&vfs, "/l1", 10);
        let cx = Cx::new();

        locks.acquire(&cx, TxnId(1), LockLevel::Shared).unwrap();
        locks.acquire(&cx, TxnId(2), LockLevel::Shared).unwrap();
        locks.acquire(&cx, TxnId(3), LockLevel::Shared).unwrap();

        locks.acquire(&cx, TxnId(1), LockLevel::Reserved).unwrap();
        assert!(matches!(
            locks.acquire(&cx, TxnId(2), LockLevel::Reserved).unwrap_err(),
            StrataError::Busy
        ));

        locks.release(&cx, TxnId(1)).unwrap();
        locks.acquire(&cx, TxnId(2), LockLevel::Reserved).unwrap();
        locks.release(&cx, TxnId(2)).unwrap();
        locks.release(&cx, TxnId(3)).unwrap();
    }

    #[test]
    fn pending_blocks_new_shared() {
        let vfs = MemoryVfs::new();
        let locks = manager(&vfs, "/l2", 10);
        let cx = Cx::new();

        locks.acquire(&cx, TxnId(1), LockLevel::Shared).unwrap();
        locks.acquire(&cx, TxnId(2), LockLevel::Shared).unwrap();
        locks.acquire(&cx, TxnId(1), LockLevel::Reserved).unwrap();
        locks.acquire(&cx, TxnId(1), LockLevel::Pending).unwrap();

        assert!(matches!(
            locks.acquire(&cx, TxnId(3), LockLevel::Shared).unwrap_err(),
            StrataError::Busy
        ));

        // Existing reader still blocks Exclusive.
        assert!(matches!(
            locks
                .acquire(&cx, TxnId(1), LockLevel::Exclusive)
                .unwrap_err(),
            StrataError::Busy
        ));

        // Reader drains; writer completes the ladder.
        locks.release(&cx, TxnId(2)).unwrap();
        locks.acquire(&cx, TxnId(1), LockLevel::Exclusive).unwrap();
        locks.release(&cx, TxnId(1)).unwrap();
    }

    #[test]
    fn level_is_monotone_until_release() {
        let vfs = MemoryVfs::new();
        let locks = manager(&vfs, "/l3", 10);
        let cx = Cx::new();

        locks.acquire(&cx, TxnId(1), LockLevel::Shared).unwrap();
        locks.acquire(&cx, TxnId(1), LockLevel::Reserved).unwrap();
        // A lower request is a no-op, not a downgrade.
        locks.acquire(&cx, TxnId(1), LockLevel::Shared).unwrap();
        assert_eq!(locks.level(TxnId(1)), LockLevel::Reserved);
        locks.release(&cx, TxnId(1)).unwrap();
        assert_eq!(locks.level(TxnId(1)), LockLevel::None);
    }

    #[test]
    fn backoff_times_out_as_busy_without_cycle() {
        let vfs = MemoryVfs::new();
        let locks = manager(&vfs, "/l4", 20);
        let cx = Cx::new();

        locks.acquire(&cx, TxnId(1), LockLevel::Shared).unwrap();
        locks.acquire(&cx, TxnId(1), LockLevel::Reserved).unwrap();

        locks.acquire(&cx, TxnId(2), LockLevel::Shared).unwrap();
        let start = Instant::now();
        let err = locks
            .acquire_with_backoff(&cx, TxnId(2), LockLevel::Reserved)
            .unwrap_err();
        assert!(matches!(err, StrataError::Busy));
        assert!(start.elapsed() >= Duration::from_millis(20));
        locks.release(&cx, TxnId(1)).unwrap();
        locks.release(&cx, TxnId(2)).unwrap();
    }

    #[test]
    fn cycle_aborts_youngest() {
        let vfs = MemoryVfs::new();
        let locks = manager(&vfs, "/l5", 10);
        let cx = Cx::new();

        // T1 holds Reserved; T2 waits on T1. T1 in turn waits on T2 for a
        // companion resource (edge injected as the second file would).
        locks.acquire(&cx, TxnId(1), LockLevel::Shared).unwrap();
        locks.acquire(&cx, TxnId(1), LockLevel::Reserved).unwrap();
        locks.acquire(&cx, TxnId(2), LockLevel::Shared).unwrap();

        assert!(matches!(
            locks.acquire(&cx, TxnId(2), LockLevel::Reserved).unwrap_err(),
            StrataError::Busy
        ));
        locks.note_wait(TxnId(1), TxnId(2));

        // T2's busy-timeout expires: the walk finds T2 -> T1 -> T2 and
        // aborts the youngest member, which is T2 itself.
        let err = locks
            .acquire_with_backoff(&cx, TxnId(2), LockLevel::Reserved)
            .unwrap_err();
        assert!(matches!(err, StrataError::Deadlock { victim: 2 }));

        locks.release(&cx, TxnId(2)).unwrap();
        locks.release(&cx, TxnId(1)).unwrap();
    }

    #[test]
    fn older_waiter_dooms_younger_holder() {
        let vfs = MemoryVfs::new();
        let locks = manager(&vfs, "/l6", 10);
        let cx = Cx::new();

        locks.acquire(&cx, TxnId(5), LockLevel::Shared).unwrap();
        locks.acquire(&cx, TxnId(5), LockLevel::Reserved).unwrap();
        locks.acquire(&cx, TxnId(3), LockLevel::Shared).unwrap();

        // T3 (older) waits on T5; T5 waits on T3: cycle, youngest is T5.
        assert!(matches!(
            locks.acquire(&cx, TxnId(3), LockLevel::Reserved).unwrap_err(),
            StrataError::Busy
        ));
        locks.note_wait(TxnId(5), TxnId(3));

        let err = locks
            .acquire_with_backoff(&cx, TxnId(3), LockLevel::Reserved)
            .unwrap_err();
        // The older waiter reports Busy; the younger holder is doomed.
        assert!(matches!(err, StrataError::Busy));
        assert!(matches!(
            locks.acquire(&cx, TxnId(5), LockLevel::Pending).unwrap_err(),
            StrataError::Deadlock { victim: 5 }
        ));

        locks.release(&cx, TxnId(5)).unwrap();
        // With T5 gone, T3 proceeds.
        locks.acquire(&cx, TxnId(3), LockLevel::Reserved).unwrap();
        locks.release(&cx, TxnId(3)).unwrap();
    }

    #[test]
    fn cancellation_preempts_backoff() {
        let vfs = MemoryVfs::new();
        let locks = manager(&vfs, "/l7", 5_000);
        let cx = Cx::new();

        locks.acquire(&cx, TxnId(1), LockLevel::Shared).unwrap();
        locks.acquire(&cx, TxnId(1), LockLevel::Reserved).unwrap();
        locks.acquire(&cx, TxnId(2), LockLevel::Shared).unwrap();

        let cancel_cx = cx.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cancel_cx.cancel();
        });

        let start = Instant::now();
        let err = locks
            .acquire_with_backoff(&cx, TxnId(2), LockLevel::Reserved)
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, StrataError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn cross_handle_conflict_via_kernel() {
        // Two lock managers on the same file model two processes; the
        // memory VFS node carries the shared lock state.
        let vfs = MemoryVfs::new();
        let a = manager(&vfs, "/l8", 10);
        let b = manager(&vfs, "/l8", 10);
        let cx = Cx::new();

        a.acquire(&cx, TxnId(1), LockLevel::Shared).unwrap();
        a.acquire(&cx, TxnId(1), LockLevel::Reserved).unwrap();

        b.acquire(&cx, TxnId(9), LockLevel::Shared).unwrap();
        assert!(matches!(
            b.acquire(&cx, TxnId(9), LockLevel::Reserved).unwrap_err(),
            StrataError::Busy
        ));

        a.release(&cx, TxnId(1)).unwrap();
        b.acquire(&cx, TxnId(9), LockLevel::Reserved).unwrap();
        b.release(&cx, TxnId(9)).unwrap();
    }
}
