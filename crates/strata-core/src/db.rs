//! The database handle: open, recover, transact, checkpoint, close.
//!
//! Ownership is hierarchical — the handle owns the VFS reference, pager,
//! lock manager, and transaction manager; transactions borrow into them
//! through the manager for the duration of their operations and never
//! outlive the handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use strata_error::{Result, StrataError};
use strata_pager::journal::read_records;
use strata_pager::Pager;
use strata_txn::{
    journal_path, read_header, recover, wal_path, CounterSnapshot, LockManager, Transaction,
    TxnConfig, TxnManager, TxnManagerArgs,
};
use strata_types::cx::Cx;
use strata_types::flags::{AccessFlags, VfsOpenFlags};
use strata_types::limits::{DATABASE_HEADER_SIZE, DEFAULT_CACHE_PAGES};
use strata_types::{
    CheckpointMode, DatabaseHeader, JournalMode, PageData, PageNumber, PageSize,
};
use strata_vfs::{registry, MemoryVfs, Vfs};
use strata_wal::{WalFile, WalIndex, WalSalts};
use tracing::info;

use crate::dsn::{AccessMode, CacheScope, DataSourceConfig};

/// Pagers shared across handles for `cache=shared` data sources, keyed by
/// canonical path. Memory databases are always private.
fn shared_pagers() -> &'static Mutex<HashMap<PathBuf, Weak<Pager>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<Pager>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// An open database.
pub struct Database {
    vfs: Arc<dyn Vfs>,
    pager: Arc<Pager>,
    txn: TxnManager,
    config: DataSourceConfig,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open a database from a data-source string, using the registered
    /// default VFS (or an in-memory one for `mode=memory`).
    pub fn open(cx: &Cx, dsn: &str) -> Result<Self> {
        let config = DataSourceConfig::parse(dsn)?;
        let vfs: Arc<dyn Vfs> = if config.is_memory() {
            Arc::new(MemoryVfs::new())
        } else {
            registry::default_vfs()
        };
        Self::open_with_vfs(cx, config, vfs)
    }

    /// Open with an explicit VFS (sandboxed, memory, custom).
    pub fn open_with_vfs(cx: &Cx, mut config: DataSourceConfig, vfs: Arc<dyn Vfs>) -> Result<Self> {
        cx.checkpoint()?;
        let path = vfs.full_pathname(cx, &config.path)?;

        let open_flags = match config.mode {
            AccessMode::ReadOnly => VfsOpenFlags::MAIN_DB | VfsOpenFlags::READONLY,
            AccessMode::ReadWrite => VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE,
            AccessMode::ReadWriteCreate | AccessMode::Memory => {
                VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE
            }
        };
        let mut file = vfs.open(cx, &path, open_flags)?;
        let file_size = file.file_size(cx)?;

        // Parse (or create) the header before the pager exists: the page
        // size comes from it.
        let (header, freshly_created) = if file_size == 0 {
            if config.is_read_only() {
                file.close(cx)?;
                return Err(StrataError::invalid_format("empty file opened read-only"));
            }
            (
                DatabaseHeader::new(config.page_size, config.journal_mode.is_wal()),
                true,
            )
        } else {
            let mut buf = [0u8; DATABASE_HEADER_SIZE];
            let n = file.read(cx, &mut buf, 0)?;
            if n < DATABASE_HEADER_SIZE {
                file.close(cx)?;
                return Err(StrataError::NotADatabase { path });
            }
            (DatabaseHeader::parse(&buf)?, false)
        };
        let page_size = header.page_size;

        // The file's declared format wins when the DSN left the mode to
        // default.
        if !config.journal_mode_explicit
            && !freshly_created
            && header.read_format == strata_types::header::FORMAT_WAL
        {
            config.journal_mode = JournalMode::Wal;
        }

        let (pager, reused) =
            Self::obtain_pager(cx, &config, &path, file, page_size, header.db_size_in_pages)?;
        if freshly_created && !reused {
            let mut page_one = PageData::zeroed(page_size);
            page_one.as_bytes_mut()[..DATABASE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
            pager.apply_page_image(cx, PageNumber::ONE, page_one.as_bytes())?;
            pager.sync(cx)?;
        }

        // Recovery, then the settled header.
        let mut wal = if config.is_read_only() {
            Self::read_only_companions(cx, &vfs, &path)?
        } else {
            let (_report, wal) = recover(cx, &vfs, &path, &pager, config.journal_mode.is_wal())?;
            wal
        };
        let header = read_header(cx, &pager, wal.as_mut())?;
        pager.set_page_count(
            wal.as_ref()
                .and_then(|(w, _)| w.committed_db_size())
                .unwrap_or(header.db_size_in_pages)
                .max(1),
        );

        // WAL mode with no WAL on disk yet: start a fresh one.
        if config.journal_mode.is_wal() && wal.is_none() && !config.is_read_only() {
            wal = Some(Self::create_wal(cx, &vfs, &path, page_size)?);
        }

        let lock_file = vfs.open(
            cx,
            &path,
            if config.is_read_only() {
                VfsOpenFlags::MAIN_DB | VfsOpenFlags::READONLY
            } else {
                VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE
            },
        )?;
        let locks = Arc::new(LockManager::new(lock_file, config.busy_timeout));

        let txn = TxnManager::new(TxnManagerArgs {
            pager: Arc::clone(&pager),
            locks,
            vfs: Arc::clone(&vfs),
            db_path: path.clone(),
            config: TxnConfig {
                journal_mode: config.journal_mode,
                synchronous: config.synchronous,
                read_only: config.is_read_only(),
                ..TxnConfig::default()
            },
            header,
            wal,
        });

        info!(
            path = %path.display(),
            mode = %config.journal_mode,
            page_size = %page_size,
            "database opened"
        );
        Ok(Self {
            vfs,
            pager,
            txn,
            config,
            path,
        })
    }

    fn obtain_pager(
        cx: &Cx,
        config: &DataSourceConfig,
        path: &Path,
        file: Box<dyn strata_vfs::VfsFile>,
        page_size: PageSize,
        db_size: u32,
    ) -> Result<(Arc<Pager>, bool)> {
        if config.cache == CacheScope::Shared && !config.is_memory() {
            let mut registry = shared_pagers().lock();
            if let Some(existing) = registry.get(path).and_then(Weak::upgrade) {
                let mut file = file;
                file.close(cx)?;
                return Ok((existing, true));
            }
            let pager = Arc::new(Pager::new(file, page_size, db_size.max(1), DEFAULT_CACHE_PAGES));
            registry.insert(path.to_path_buf(), Arc::downgrade(&pager));
            return Ok((pager, false));
        }
        Ok((
            Arc::new(Pager::new(file, page_size, db_size.max(1), DEFAULT_CACHE_PAGES)),
            false,
        ))
    }

    /// Read-only open: refuse to touch a hot journal, adopt a WAL for
    /// reading if one exists.
    fn read_only_companions(
        cx: &Cx,
        vfs: &Arc<dyn Vfs>,
        path: &Path,
    ) -> Result<Option<(WalFile, WalIndex)>> {
        let jpath = journal_path(path);
        if vfs.access(cx, &jpath, AccessFlags::EXISTS)? {
            let mut file = vfs.open(cx, &jpath, VfsOpenFlags::JOURNAL | VfsOpenFlags::READONLY)?;
            let scan = read_records(cx, file.as_mut());
            file.close(cx)?;
            if matches!(scan?, Some((_, records)) if !records.is_empty()) {
                // Recovery requires writing; a read-only handle cannot.
                return Err(StrataError::ReadOnly);
            }
        }

        let wpath = wal_path(path);
        if !vfs.access(cx, &wpath, AccessFlags::EXISTS)? {
            return Ok(None);
        }
        let file = vfs.open(cx, &wpath, VfsOpenFlags::WAL | VfsOpenFlags::READONLY)?;
        let wal = WalFile::open(cx, file)?;
        let index = WalIndex::build(wal.frames());
        Ok(Some((wal, index)))
    }

    fn create_wal(
        cx: &Cx,
        vfs: &Arc<dyn Vfs>,
        path: &Path,
        page_size: PageSize,
    ) -> Result<(WalFile, WalIndex)> {
        let file = vfs.open(
            cx,
            &wal_path(path),
            VfsOpenFlags::WAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE,
        )?;
        let mut salt_bytes = [0u8; 8];
        vfs.randomness(cx, &mut salt_bytes);
        let salts = WalSalts {
            salt1: u32::from_le_bytes(salt_bytes[..4].try_into().expect("4 bytes")),
            salt2: u32::from_le_bytes(salt_bytes[4..].try_into().expect("4 bytes")),
        };
        let wal = WalFile::create(cx, file, page_size.get(), 0, salts)?;
        Ok((wal, WalIndex::new()))
    }

    // -- Transaction surface --------------------------------------------

    /// Begin a transaction.
    pub fn begin(&self, cx: &Cx) -> Result<Transaction> {
        self.txn.begin(cx)
    }

    /// Read a page within `tx`.
    pub fn read_page(&self, cx: &Cx, tx: &Transaction, page: PageNumber) -> Result<Arc<PageData>> {
        self.txn.read_page(cx, tx, page)
    }

    /// Write a page within `tx`.
    pub fn write_page(
        &self,
        cx: &Cx,
        tx: &mut Transaction,
        page: PageNumber,
        bytes: &[u8],
    ) -> Result<()> {
        self.txn.write_page(cx, tx, page, bytes)
    }

    /// Create a savepoint.
    pub fn savepoint(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        self.txn.savepoint(tx, name)
    }

    /// Release a savepoint into its parent.
    pub fn release_savepoint(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        self.txn.release_savepoint(tx, name)
    }

    /// Roll back to a savepoint.
    pub fn rollback_to_savepoint(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        self.txn.rollback_to_savepoint(tx, name)
    }

    /// Commit.
    pub fn commit(&self, cx: &Cx, tx: &mut Transaction) -> Result<()> {
        self.txn.commit(cx, tx)
    }

    /// Roll back.
    pub fn rollback(&self, cx: &Cx, tx: &mut Transaction) -> Result<()> {
        self.txn.rollback(cx, tx)
    }

    /// Run a WAL checkpoint.
    pub fn checkpoint(&self, cx: &Cx, mode: CheckpointMode) -> Result<()> {
        self.txn.checkpoint(cx, mode).map(|_| ())
    }

    // -- Introspection ---------------------------------------------------

    /// The database page size.
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.pager.page_size()
    }

    /// Logical size in pages as of the last commit.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.txn.committed_db_size()
    }

    /// Current file header state.
    #[must_use]
    pub fn header(&self) -> DatabaseHeader {
        self.txn.header()
    }

    /// Monotonic counters (pull interface).
    #[must_use]
    pub fn counters(&self) -> CounterSnapshot {
        self.txn.counters().snapshot()
    }

    /// The parsed data-source configuration.
    #[must_use]
    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// The canonical database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The VFS this handle operates through.
    #[must_use]
    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    /// Flush and close. With `cache=shared` the pager's file handle stays
    /// open while other handles still use it (the handle and its
    /// transaction manager hold the only strong references otherwise).
    pub fn close(&self, cx: &Cx) -> Result<()> {
        self.txn.close(cx)?;
        if Arc::strong_count(&self.pager) <= 2 {
            if self.config.cache == CacheScope::Shared {
                shared_pagers().lock().remove(&self.path);
            }
            self.pager.close(cx)
        } else {
            self.pager.flush_dirty(cx)
        }
    }
}
