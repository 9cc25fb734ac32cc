//! Transaction manager: ACID over the pager, in both durability modes.
//!
//! Writes never touch shared state before commit. Each transaction stages
//! its modifications in a private write set, so other transactions read
//! the last committed state until commit succeeds (isolation), while the
//! owner reads its own writes. Pre-images are captured into the rollback
//! journal at first touch (journal mode); WAL mode appends the whole write
//! set as frames at commit, with the final frame carrying the commit mark.
//!
//! State machine per transaction:
//!
//! ```text
//!    begin ──▶ Active(Shared) ──first write──▶ Active(Reserved)
//!                   │ commit                        │ rollback
//!                   ▼                               ▼
//!              Committing ──▶ Committed    RollingBack ──▶ RolledBack
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use strata_error::{Result, StrataError};
use strata_pager::journal::{self, JournalFile};
use strata_pager::Pager;
use strata_types::cx::Cx;
use strata_types::flags::VfsOpenFlags;
use strata_types::limits::DATABASE_HEADER_SIZE;
use strata_types::{
    CheckpointMode, DatabaseHeader, JournalMode, LockLevel, PageData, PageNumber, SynchronousMode,
    TxnId,
};
use strata_vfs::Vfs;
use strata_wal::checkpoint::{execute_checkpoint, CheckpointPageWriter, CheckpointResult};
use strata_wal::{WalFile, WalIndex, WalSalts};
use tracing::{debug, info, warn};

use crate::counters::Counters;
use crate::lock::LockManager;

/// Configuration the transaction manager runs under.
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Durability mode for write transactions.
    pub journal_mode: JournalMode,
    /// Sync frequency.
    pub synchronous: SynchronousMode,
    /// Savepoint stack depth cap.
    pub max_savepoint_depth: usize,
    /// Whether writes are rejected outright.
    pub read_only: bool,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::default(),
            synchronous: SynchronousMode::default(),
            max_savepoint_depth: strata_types::limits::DEFAULT_MAX_SAVEPOINT_DEPTH,
            read_only: false,
        }
    }
}

/// Lifecycle state of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    RolledBack,
}

struct SavepointFrame {
    name: String,
    /// `(page, previous write-set entry)` for the first touch of each page
    /// after this savepoint; `None` means the page was not in the write
    /// set, so rolling back removes it.
    undo: Vec<(PageNumber, Option<Arc<PageData>>)>,
    touched: HashSet<PageNumber>,
}

/// One open transaction. Resolve it with [`TxnManager::commit`] or
/// [`TxnManager::rollback`]; a transaction dropped while still active
/// releases its locks and counts as a rollback (no I/O runs in drop — a
/// cold journal left behind is cleaned up by recovery).
pub struct Transaction {
    id: TxnId,
    started: Instant,
    status: TxnStatus,
    write_set: BTreeMap<PageNumber, Arc<PageData>>,
    savepoints: Vec<SavepointFrame>,
    journal: Option<JournalFile>,
    journaled: HashSet<u32>,
    /// Committed database size observed at begin.
    initial_db_size: u32,
    /// WAL frame count visible to this transaction's reads.
    read_watermark: u32,
    locks: Arc<LockManager>,
    readers: Arc<Mutex<HashMap<TxnId, u32>>>,
    counters: Arc<Counters>,
}

impl Transaction {
    /// The transaction's id.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Pages this transaction has written so far.
    #[must_use]
    pub fn pages_dirty(&self) -> usize {
        self.write_set.len()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status == TxnStatus::Active {
            Ok(())
        } else {
            Err(StrataError::TxnNotActive { txn_id: self.id.0 })
        }
    }

    fn find_savepoint(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .rposition(|frame| frame.name == name)
            .ok_or_else(|| StrataError::NoSuchSavepoint {
                name: name.to_owned(),
            })
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status != TxnStatus::Active {
            return;
        }
        warn!(txn = %self.id, "transaction dropped while active; releasing locks");
        let cx = Cx::new();
        drop(self.locks.release(&cx, self.id));
        self.readers.lock().remove(&self.id);
        Counters::bump(&self.counters.rollbacks);
    }
}

struct WalState {
    wal: WalFile,
    index: WalIndex,
}

/// Everything a [`TxnManager`] is built from.
pub struct TxnManagerArgs {
    pub pager: Arc<Pager>,
    pub locks: Arc<LockManager>,
    pub vfs: Arc<dyn Vfs>,
    pub db_path: PathBuf,
    pub config: TxnConfig,
    pub header: DatabaseHeader,
    /// WAL file and index, present when the database runs in WAL mode.
    pub wal: Option<(WalFile, WalIndex)>,
}

/// The transaction manager for one database handle.
pub struct TxnManager {
    pager: Arc<Pager>,
    locks: Arc<LockManager>,
    vfs: Arc<dyn Vfs>,
    db_path: PathBuf,
    config: TxnConfig,
    header: Mutex<DatabaseHeader>,
    wal: Mutex<Option<WalState>>,
    /// Database size in pages as of the last commit.
    committed_db_size: AtomicU64,
    next_txn_id: AtomicU64,
    /// Active transactions and their WAL read watermarks.
    readers: Arc<Mutex<HashMap<TxnId, u32>>>,
    counters: Arc<Counters>,
    /// Backing store for `journal_mode=MEMORY` journals.
    mem_journal_vfs: strata_vfs::MemoryVfs,
}

impl TxnManager {
    /// Construct a manager over an opened, recovered database.
    #[must_use]
    pub fn new(args: TxnManagerArgs) -> Self {
        let committed = args
            .wal
            .as_ref()
            .and_then(|(wal, _)| wal.committed_db_size())
            .unwrap_or(args.header.db_size_in_pages)
            .max(1);
        Self {
            pager: args.pager,
            locks: args.locks,
            vfs: args.vfs,
            db_path: args.db_path,
            config: args.config,
            header: Mutex::new(args.header),
            wal: Mutex::new(args.wal.map(|(wal, index)| WalState { wal, index })),
            committed_db_size: AtomicU64::new(u64::from(committed)),
            next_txn_id: AtomicU64::new(1),
            readers: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::new()),
            mem_journal_vfs: strata_vfs::MemoryVfs::new(),
        }
    }

    /// The shared counter block.
    #[must_use]
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// The configured durability mode.
    #[must_use]
    pub fn journal_mode(&self) -> JournalMode {
        self.config.journal_mode
    }

    /// Snapshot of the in-memory header.
    #[must_use]
    pub fn header(&self) -> DatabaseHeader {
        self.header.lock().clone()
    }

    /// Database size in pages as of the last commit.
    #[must_use]
    pub fn committed_db_size(&self) -> u32 {
        u32::try_from(self.committed_db_size.load(Ordering::Acquire)).unwrap_or(u32::MAX)
    }

    /// Begin a transaction: acquire `Shared`, pin the snapshot watermark.
    pub fn begin(&self, cx: &Cx) -> Result<Transaction> {
        cx.checkpoint()?;
        let id = TxnId(self.next_txn_id.fetch_add(1, Ordering::Relaxed));
        self.locks.acquire_with_backoff(cx, id, LockLevel::Shared)?;
        if let Err(err) = self.sync_with_siblings(cx) {
            drop(self.locks.release(cx, id));
            return Err(err);
        }

        let read_watermark = {
            let wal = self.wal.lock();
            wal.as_ref()
                .map_or(0, |state| u32::try_from(state.wal.frame_count()).unwrap_or(u32::MAX))
        };
        self.readers.lock().insert(id, read_watermark);

        debug!(txn = %id, read_watermark, "transaction begun");
        Ok(Transaction {
            id,
            started: Instant::now(),
            status: TxnStatus::Active,
            write_set: BTreeMap::new(),
            savepoints: Vec::new(),
            journal: None,
            journaled: HashSet::new(),
            initial_db_size: self.committed_db_size(),
            read_watermark,
            locks: Arc::clone(&self.locks),
            readers: Arc::clone(&self.readers),
            counters: Arc::clone(&self.counters),
        })
    }

    /// Catch up with commits made through sibling handles (other handles
    /// in this process, or other processes) since this manager last
    /// looked. In WAL mode the WAL file is rescanned; in journal mode a
    /// changed header change-counter invalidates the page cache.
    fn sync_with_siblings(&self, cx: &Cx) -> Result<()> {
        if self.config.journal_mode.is_wal() {
            let mut guard = self.wal.lock();
            if let Some(state) = guard.as_mut() {
                if state.wal.refresh(cx)? {
                    state.index = WalIndex::build(state.wal.frames());
                    if let Some(db_size) = state.wal.committed_db_size() {
                        self.committed_db_size
                            .store(u64::from(db_size), Ordering::Release);
                    }
                }
            }
            return Ok(());
        }

        let mut buf = [0u8; DATABASE_HEADER_SIZE];
        let read = self
            .pager
            .with_file(|file| file.read(cx, &mut buf, 0))?;
        if read < DATABASE_HEADER_SIZE {
            return Ok(()); // freshly created file, nothing committed yet
        }
        let Ok(disk) = DatabaseHeader::parse(&buf) else {
            return Ok(()); // recovery/validation owns malformed headers
        };
        let mut ours = self.header.lock();
        if disk.file_change_counter != ours.file_change_counter {
            debug!(
                theirs = disk.file_change_counter,
                ours = ours.file_change_counter,
                "foreign commit detected; resetting page cache"
            );
            self.pager.reset_cache();
            self.pager.set_page_count(disk.db_size_in_pages.max(1));
            self.committed_db_size
                .store(u64::from(disk.db_size_in_pages.max(1)), Ordering::Release);
            *ours = disk;
        }
        Ok(())
    }

    /// Read a page as this transaction sees it: its own writes first, then
    /// the WAL at its snapshot watermark, then the main file.
    pub fn read_page(&self, cx: &Cx, tx: &Transaction, page: PageNumber) -> Result<Arc<PageData>> {
        tx.ensure_active()?;
        if let Some(data) = tx.write_set.get(&page) {
            return Ok(Arc::clone(data));
        }
        if self.config.journal_mode.is_wal() {
            let mut wal = self.wal.lock();
            if let Some(state) = wal.as_mut() {
                if let Some(frame) = state.index.lookup(page.get(), tx.read_watermark) {
                    let image = state.wal.read_frame_page(cx, frame as usize)?;
                    return Ok(Arc::new(image));
                }
            }
        }
        self.pager.get_page(cx, page)
    }

    /// Write a page within the transaction. Promotes the lock to
    /// `Reserved` on first write and captures the pre-image before the
    /// modification becomes visible to any commit path.
    pub fn write_page(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        page: PageNumber,
        bytes: &[u8],
    ) -> Result<()> {
        cx.checkpoint()?;
        tx.ensure_active()?;
        if self.config.read_only {
            return Err(StrataError::ReadOnly);
        }
        let page_size = self.pager.page_size().as_usize();
        if bytes.len() != page_size {
            return Err(StrataError::SizeMismatch {
                expected: page_size,
                actual: bytes.len(),
            });
        }

        if self.locks.level(tx.id) < LockLevel::Reserved {
            self.promote_to_reserved(cx, tx)?;
        }

        if !matches!(self.config.journal_mode, JournalMode::Wal | JournalMode::Off) {
            self.capture_preimage(cx, tx, page)?;
        }

        if let Some(frame) = tx.savepoints.last_mut() {
            if frame.touched.insert(page) {
                frame.undo.push((page, tx.write_set.get(&page).cloned()));
            }
        }
        tx.write_set
            .insert(page, Arc::new(PageData::from_vec(bytes.to_vec())));
        Ok(())
    }

    /// Push a named savepoint.
    pub fn savepoint(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        tx.ensure_active()?;
        if tx.savepoints.len() >= self.config.max_savepoint_depth {
            return Err(StrataError::LimitExceeded {
                what: "savepoint depth",
                max: self.config.max_savepoint_depth,
            });
        }
        tx.savepoints.push(SavepointFrame {
            name: name.to_owned(),
            undo: Vec::new(),
            touched: HashSet::new(),
        });
        Counters::bump(&self.counters.savepoints);
        Ok(())
    }

    /// Release a savepoint, merging its undo records into the enclosing
    /// frame (so an outer `rollback_to` still reaches past it).
    pub fn release_savepoint(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        tx.ensure_active()?;
        let idx = tx.find_savepoint(name)?;
        let released: Vec<SavepointFrame> = tx.savepoints.split_off(idx);
        if let Some(parent) = tx.savepoints.last_mut() {
            // Oldest frames first so the earliest pre-image per page wins.
            for frame in released {
                for (page, pre) in frame.undo {
                    if parent.touched.insert(page) {
                        parent.undo.push((page, pre));
                    }
                }
            }
        }
        Ok(())
    }

    /// Roll back to a savepoint: undo every write made after it. The
    /// savepoint itself stays on the stack.
    pub fn rollback_to_savepoint(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        tx.ensure_active()?;
        let idx = tx.find_savepoint(name)?;
        while tx.savepoints.len() > idx + 1 {
            let frame = tx.savepoints.pop().expect("length checked");
            Self::apply_undo(tx, frame.undo);
        }
        let frame = tx.savepoints.last_mut().expect("target frame exists");
        let undo = std::mem::take(&mut frame.undo);
        frame.touched.clear();
        Self::apply_undo(tx, undo);
        Ok(())
    }

    fn apply_undo(tx: &mut Transaction, undo: Vec<(PageNumber, Option<Arc<PageData>>)>) {
        for (page, pre) in undo.into_iter().rev() {
            match pre {
                Some(data) => {
                    tx.write_set.insert(page, data);
                }
                None => {
                    tx.write_set.remove(&page);
                }
            }
        }
    }

    /// Commit the transaction.
    pub fn commit(&self, cx: &Cx, tx: &mut Transaction) -> Result<()> {
        tx.ensure_active()?;
        let pages_dirty = tx.write_set.len();
        let result = self.commit_inner(cx, tx);
        let duration_ms = tx.started.elapsed().as_millis();
        match &result {
            Ok(()) => {
                tx.status = TxnStatus::Committed;
                self.finish(cx, tx)?;
                Counters::bump(&self.counters.commits);
                info!(
                    tx_id = tx.id.0,
                    duration_ms,
                    mode = %self.config.journal_mode,
                    pages_dirty,
                    "transaction committed"
                );
            }
            Err(err) => {
                // The transaction stays active; the caller rolls it back
                // (or recovery finishes the job after a crash).
                info!(
                    tx_id = tx.id.0,
                    duration_ms,
                    mode = %self.config.journal_mode,
                    pages_dirty,
                    err = %err,
                    "commit failed"
                );
            }
        }
        result
    }

    fn commit_inner(&self, cx: &Cx, tx: &mut Transaction) -> Result<()> {
        if tx.write_set.is_empty() {
            return Ok(());
        }
        let max_page = tx
            .write_set
            .keys()
            .next_back()
            .map_or(0, |p| p.get());
        let new_db_size = self.committed_db_size().max(max_page);

        // Every committing write transaction republishes page 1 with a
        // bumped change counter and the new logical size.
        let mut header = self.header.lock().clone();
        header.record_commit(new_db_size);
        if !matches!(self.config.journal_mode, JournalMode::Wal | JournalMode::Off) {
            self.capture_preimage(cx, tx, PageNumber::ONE)?;
        }
        let mut page_one = self
            .read_page_for_commit(cx, tx, PageNumber::ONE)?
            .as_ref()
            .clone();
        page_one.as_bytes_mut()[..DATABASE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        tx.write_set.insert(PageNumber::ONE, Arc::new(page_one));

        if self.config.journal_mode.is_wal() {
            self.commit_wal(cx, tx, new_db_size)?;
        } else {
            self.commit_journal(cx, tx, new_db_size)?;
        }

        *self.header.lock() = header;
        self.committed_db_size
            .store(u64::from(new_db_size), Ordering::Release);
        Ok(())
    }

    /// `read_page` without the active-status guard, for use inside commit.
    fn read_page_for_commit(
        &self,
        cx: &Cx,
        tx: &Transaction,
        page: PageNumber,
    ) -> Result<Arc<PageData>> {
        if let Some(data) = tx.write_set.get(&page) {
            return Ok(Arc::clone(data));
        }
        if self.config.journal_mode.is_wal() {
            let mut wal = self.wal.lock();
            if let Some(state) = wal.as_mut() {
                if let Some(frame) = state.index.lookup(page.get(), tx.read_watermark) {
                    return Ok(Arc::new(state.wal.read_frame_page(cx, frame as usize)?));
                }
            }
        }
        self.pager.get_page(cx, page)
    }

    fn commit_journal(&self, cx: &Cx, tx: &mut Transaction, new_db_size: u32) -> Result<()> {
        // Pre-images durable before the main file is touched.
        if let Some(journal) = tx.journal.as_mut() {
            if self.config.synchronous != SynchronousMode::Off {
                journal.sync(cx)?;
            }
        }

        // Drain readers, then take the file exclusively.
        self.locks.acquire_with_backoff(cx, tx.id, LockLevel::Pending)?;
        self.locks
            .acquire_with_backoff(cx, tx.id, LockLevel::Exclusive)?;

        for (page, data) in &tx.write_set {
            self.pager.write_page(cx, *page, data.as_bytes())?;
        }
        self.pager
            .flush_dirty_with_sync(cx, self.config.synchronous != SynchronousMode::Off)?;
        self.pager.set_page_count(new_db_size);

        self.finalize_journal(cx, tx)?;
        Ok(())
    }

    fn commit_wal(&self, cx: &Cx, tx: &mut Transaction, new_db_size: u32) -> Result<()> {
        let mut guard = self.wal.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| StrataError::internal("WAL mode without WAL state"))?;

        let batch: Vec<(u32, &PageData)> = tx
            .write_set
            .iter()
            .map(|(page, data)| (page.get(), data.as_ref()))
            .collect();
        let watermark = state.wal.frame_count();

        let mut appended = state.wal.append_commit(cx, &batch, new_db_size).map(|_| ());
        if appended.is_ok() && self.config.synchronous != SynchronousMode::Off {
            appended = state.wal.sync(cx);
        }
        if let Err(err) = appended {
            // Leave no half-appended tail for a later writer to extend.
            if let Err(cleanup) = state.wal.truncate_to(cx, watermark) {
                warn!(err = %cleanup, "failed to trim WAL after aborted commit");
            }
            return Err(err);
        }

        for (page, _) in &batch {
            state.index.push(*page);
        }
        Counters::add(&self.counters.frames_written, batch.len() as u64);
        Ok(())
    }

    /// Roll back the transaction, reverting any pre-images that reached
    /// the main file.
    pub fn rollback(&self, cx: &Cx, tx: &mut Transaction) -> Result<()> {
        tx.ensure_active()?;
        let pages_dirty = tx.write_set.len();
        let result = self.rollback_inner(cx, tx);
        let duration_ms = tx.started.elapsed().as_millis();
        match &result {
            Ok(()) => {
                tx.status = TxnStatus::RolledBack;
                self.finish(cx, tx)?;
                Counters::bump(&self.counters.rollbacks);
                info!(
                    tx_id = tx.id.0,
                    duration_ms,
                    mode = %self.config.journal_mode,
                    pages_dirty,
                    "transaction rolled back"
                );
            }
            Err(err) => {
                warn!(
                    tx_id = tx.id.0,
                    duration_ms,
                    mode = %self.config.journal_mode,
                    pages_dirty,
                    err = %err,
                    "rollback failed"
                );
            }
        }
        result
    }

    fn rollback_inner(&self, cx: &Cx, tx: &mut Transaction) -> Result<()> {
        tx.write_set.clear();
        tx.savepoints.clear();

        if self.config.journal_mode.is_wal() {
            let mut guard = self.wal.lock();
            if let Some(state) = guard.as_mut() {
                let watermark = tx.read_watermark as usize;
                if state.wal.frame_count() > watermark {
                    state.wal.truncate_to(cx, watermark)?;
                    state.index.truncate(tx.read_watermark);
                }
            }
            return Ok(());
        }

        // Writes staged into the pager by a failed commit never belong to
        // anyone else; drop them before replaying.
        self.pager.discard_dirty();
        if tx.journal.is_some() {
            // A failed commit may have partially reached the main file;
            // replay the pre-images to undo it. For a plain rollback this
            // rewrites unmodified bytes, which is harmless.
            if let Some(journal) = tx.journal.as_mut() {
                journal.sync(cx)?;
            }
            self.replay_journal_preimages(cx, tx.initial_db_size)?;
            self.pager.sync(cx)?;
            self.finalize_journal(cx, tx)?;
        }
        Ok(())
    }

    fn replay_journal_preimages(&self, cx: &Cx, initial_db_size: u32) -> Result<()> {
        let path = journal_path(&self.db_path);
        let vfs = self.journal_vfs();
        let mut file = vfs.open(cx, &path, VfsOpenFlags::JOURNAL | VfsOpenFlags::READWRITE)?;
        let scan = journal::read_records(cx, file.as_mut());
        file.close(cx)?;
        let Some((_, records)) = scan? else {
            return Ok(());
        };
        for record in &records {
            let page = PageNumber::new(record.page_number).ok_or(StrataError::InvalidPageId)?;
            debug!(page = record.page_number, "journal pre-image replayed");
            self.pager.apply_page_image(cx, page, &record.image)?;
        }
        self.pager.truncate(cx, initial_db_size)?;
        self.pager.set_page_count(initial_db_size);
        Ok(())
    }

    fn finalize_journal(&self, cx: &Cx, tx: &mut Transaction) -> Result<()> {
        let Some(mut journal) = tx.journal.take() else {
            return Ok(());
        };
        tx.journaled.clear();
        match self.config.journal_mode {
            JournalMode::Delete | JournalMode::Memory => {
                journal.close(cx)?;
                let path = journal_path(&self.db_path);
                self.journal_vfs().delete(cx, &path, true)?;
            }
            mode @ (JournalMode::Truncate | JournalMode::Persist) => {
                journal.finalize(cx, mode)?;
                journal.close(cx)?;
            }
            JournalMode::Wal | JournalMode::Off => {
                journal.close(cx)?;
            }
        }
        Ok(())
    }

    fn promote_to_reserved(&self, cx: &Cx, tx: &Transaction) -> Result<()> {
        match self.locks.acquire_with_backoff(cx, tx.id, LockLevel::Reserved) {
            Ok(()) => {}
            Err(err @ StrataError::Deadlock { .. }) => {
                Counters::bump(&self.counters.deadlocks);
                return Err(err);
            }
            Err(err) => return Err(err),
        }
        if self.config.journal_mode.is_wal() {
            let wal = self.wal.lock();
            if let Some(state) = wal.as_ref() {
                let tail = u32::try_from(state.wal.frame_count()).unwrap_or(u32::MAX);
                if tail != tx.read_watermark {
                    // Another writer committed since this snapshot was
                    // taken; writing on top of it would lose that commit.
                    return Err(StrataError::Busy);
                }
            }
        }
        Ok(())
    }

    fn capture_preimage(&self, cx: &Cx, tx: &mut Transaction, page: PageNumber) -> Result<()> {
        if page.get() > tx.initial_db_size {
            // Page did not exist at begin; rollback truncates it away.
            return Ok(());
        }
        if !tx.journaled.insert(page.get()) {
            return Ok(());
        }
        // First write already captured the page, so a plain committed read
        // (not the write set) supplies the pre-image.
        let image = if let Some(data) = tx.write_set.get(&page) {
            // Can only happen for pages re-added by savepoint machinery;
            // the journal entry check above keeps this unreachable for the
            // normal first-write path.
            Arc::clone(data)
        } else {
            self.pager.get_page(cx, page)?
        };

        if tx.journal.is_none() {
            let path = journal_path(&self.db_path);
            let vfs = self.journal_vfs();
            let file = vfs.open(
                cx,
                &path,
                VfsOpenFlags::JOURNAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE,
            )?;
            let mut nonce_bytes = [0u8; 4];
            vfs.randomness(cx, &mut nonce_bytes);
            tx.journal = Some(JournalFile::create(
                cx,
                file,
                u32::from_le_bytes(nonce_bytes),
                tx.initial_db_size,
                self.pager.page_size(),
            )?);
        }
        let journal = tx.journal.as_mut().expect("journal just ensured");
        journal.append_preimage(cx, page.get(), image.as_bytes())?;
        Counters::bump(&self.counters.journal_pages_written);
        if self.config.synchronous == SynchronousMode::Full {
            journal.sync(cx)?;
        }
        Ok(())
    }

    fn journal_vfs(&self) -> Arc<dyn Vfs> {
        if self.config.journal_mode == JournalMode::Memory {
            Arc::new(self.mem_journal_vfs.clone())
        } else {
            Arc::clone(&self.vfs)
        }
    }

    fn finish(&self, cx: &Cx, tx: &Transaction) -> Result<()> {
        self.readers.lock().remove(&tx.id);
        self.locks.release(cx, tx.id)
    }

    /// Run a WAL checkpoint. `Unsupported` outside WAL mode; `Busy` while
    /// a writer is active.
    pub fn checkpoint(&self, cx: &Cx, mode: CheckpointMode) -> Result<CheckpointResult> {
        if !self.config.journal_mode.is_wal() {
            return Err(StrataError::Unsupported);
        }
        if self.locks.writer_active() {
            return Err(StrataError::Busy);
        }
        let mut guard = self.wal.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| StrataError::internal("WAL mode without WAL state"))?;

        let safe_watermark = {
            let readers = self.readers.lock();
            readers
                .values()
                .map(|&w| w as usize)
                .min()
                .unwrap_or_else(|| state.wal.frame_count())
        };

        let mut salt_bytes = [0u8; 8];
        self.vfs.randomness(cx, &mut salt_bytes);
        let fresh_salts = WalSalts {
            salt1: u32::from_le_bytes(salt_bytes[..4].try_into().expect("4 bytes")),
            salt2: u32::from_le_bytes(salt_bytes[4..].try_into().expect("4 bytes")),
        };

        let mut writer = PagerBackfill::new(&self.pager);
        let result = execute_checkpoint(
            cx,
            &mut state.wal,
            &mut writer,
            mode,
            safe_watermark,
            fresh_salts,
        )?;
        if result.reset {
            state.index.clear();
        }
        Ok(result)
    }

    /// Close companion handles (the WAL file and the lock file). The pager
    /// is closed by its owner.
    pub fn close(&self, cx: &Cx) -> Result<()> {
        let mut guard = self.wal.lock();
        if let Some(state) = guard.as_mut() {
            state.wal.close(cx)?;
        }
        *guard = None;
        drop(guard);
        self.locks.close(cx)
    }
}

/// Checkpoint write-back routed through the pager so the cache stays
/// coherent with the backfilled images.
pub(crate) struct PagerBackfill<'a> {
    pager: &'a Pager,
}

impl<'a> PagerBackfill<'a> {
    pub(crate) fn new(pager: &'a Pager) -> Self {
        Self { pager }
    }
}

impl CheckpointPageWriter for PagerBackfill<'_> {
    fn write_page(&mut self, cx: &Cx, page_number: u32, data: &[u8]) -> Result<()> {
        let page = PageNumber::new(page_number).ok_or(StrataError::InvalidPageId)?;
        self.pager.apply_page_image(cx, page, data)
    }

    fn truncate(&mut self, cx: &Cx, pages: u32) -> Result<()> {
        self.pager.truncate(cx, pages)
    }

    fn sync(&mut self, cx: &Cx) -> Result<()> {
        self.pager.sync(cx)
    }
}

/// Path of the rollback journal companion file.
#[must_use]
pub fn journal_path(db_path: &Path) -> PathBuf {
    companion_path(db_path, "-journal")
}

/// Path of the WAL companion file.
#[must_use]
pub fn wal_path(db_path: &Path) -> PathBuf {
    companion_path(db_path, "-wal")
}

fn companion_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
