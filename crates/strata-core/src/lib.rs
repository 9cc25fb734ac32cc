//! stratadb core: the transactional storage engine behind an embedded,
//! single-file-format-compatible database.
//!
//! The core turns a raw file into a durable, concurrent, crash-safe page
//! store: the on-disk binary layout, a pager with an adaptive replacement
//! cache, write-ahead-log and rollback-journal durability, the five-level
//! lock ladder, and open-time recovery.
//!
//! ```no_run
//! use strata_core::Database;
//! use strata_types::{Cx, PageNumber};
//!
//! # fn main() -> strata_error::Result<()> {
//! let cx = Cx::new();
//! let db = Database::open(&cx, "file:app.db?journal_mode=WAL")?;
//!
//! let mut tx = db.begin(&cx)?;
//! let page = PageNumber::new(2).unwrap();
//! db.write_page(&cx, &mut tx, page, &vec![0u8; db.page_size().as_usize()])?;
//! db.commit(&cx, &mut tx)?;
//! db.close(&cx)?;
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod dsn;
pub mod observability;

pub use db::Database;
pub use dsn::{AccessMode, CacheScope, DataSourceConfig};

pub use strata_error::{ErrorCode, Result, StrataError};
pub use strata_txn::{CounterSnapshot, Transaction, TxnStatus};
pub use strata_types::{CheckpointMode, Cx, JournalMode, PageNumber, PageSize, SynchronousMode};
