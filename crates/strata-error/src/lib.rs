use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for stratadb storage operations.
///
/// Structured variants for the failure classes a caller can act on,
/// with a numeric [`ErrorCode`] mapping for compatibility with tooling
/// that expects SQLite-style result codes.
#[derive(Error, Debug)]
pub enum StrataError {
    // === Open / format ===
    /// File header magic, version, or page-size check failed.
    #[error("invalid database format: {detail}")]
    InvalidFormat { detail: String },

    /// File is not a database at all.
    #[error("file is not a database: '{path}'")]
    NotADatabase { path: PathBuf },

    /// Unable to open the database file.
    #[error("unable to open database file: '{path}'")]
    CannotOpen { path: PathBuf },

    /// Malformed or unsupported data-source string.
    #[error("invalid data source string: {detail}")]
    InvalidDsn { detail: String },

    // === Programming errors ===
    /// Page 0 supplied (page numbers are 1-based).
    #[error("invalid page id: 0")]
    InvalidPageId,

    /// Buffer length does not match the database page size.
    #[error("page size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// Savepoint stack depth cap (or a similar hard limit) exceeded.
    #[error("limit exceeded: {what} (max {max})")]
    LimitExceeded { what: &'static str, max: usize },

    /// No savepoint with the given name in the current transaction.
    #[error("no such savepoint: {name}")]
    NoSuchSavepoint { name: String },

    /// Operation on a transaction that is no longer active.
    #[error("transaction {txn_id} is not active")]
    TxnNotActive { txn_id: u64 },

    // === I/O ===
    /// Underlying read/write/sync/truncate failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer bytes than required where a full read was mandatory.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    // === Locking ===
    /// Lock contention: a non-blocking lock request failed.
    #[error("database is busy")]
    Busy,

    /// Wait-graph cycle detected; this (youngest) transaction was aborted.
    #[error("deadlock detected: transaction {victim} aborted")]
    Deadlock { victim: u64 },

    // === Corruption ===
    /// Checksum mismatch or structurally invalid durability state.
    #[error("database disk image is malformed: {detail}")]
    Corrupt { detail: String },

    /// WAL file failed validation.
    #[error("WAL file is corrupt: {detail}")]
    WalCorrupt { detail: String },

    /// Rollback journal failed validation.
    #[error("rollback journal is corrupt: {detail}")]
    JournalCorrupt { detail: String },

    // === Cooperative cancellation ===
    /// The caller-supplied cancellation token tripped.
    #[error("operation cancelled")]
    Cancelled,

    // === Access ===
    /// Write attempted on a read-only database handle.
    #[error("attempt to write a readonly database")]
    ReadOnly,

    /// Sandboxed VFS denied the path.
    #[error("access denied: '{path}' is not an allowed path")]
    AccessDenied { path: PathBuf },

    // === Internal ===
    /// Internal invariant violation (should never happen).
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation is not supported by the current backend or configuration.
    #[error("unsupported operation")]
    Unsupported,
}

/// SQLite-style numeric result codes, for tooling compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Access permission denied.
    Perm = 3,
    /// Callback requested abort.
    Abort = 4,
    /// Database file is locked.
    Busy = 5,
    /// Attempt to write a read-only database.
    ReadOnly = 8,
    /// Interrupted.
    Interrupt = 9,
    /// Disk I/O error.
    IoErr = 10,
    /// Database disk image is malformed.
    Corrupt = 11,
    /// Unable to open database file.
    CantOpen = 14,
    /// Library used incorrectly.
    Misuse = 21,
    /// Not a database file.
    NotADb = 26,
}

impl StrataError {
    /// Map this error to a numeric code.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidFormat { .. } | Self::NotADatabase { .. } => ErrorCode::NotADb,
            Self::CannotOpen { .. } | Self::InvalidDsn { .. } => ErrorCode::CantOpen,
            Self::InvalidPageId
            | Self::SizeMismatch { .. }
            | Self::LimitExceeded { .. }
            | Self::NoSuchSavepoint { .. }
            | Self::TxnNotActive { .. } => ErrorCode::Misuse,
            Self::Io(_) | Self::ShortRead { .. } => ErrorCode::IoErr,
            Self::Busy | Self::Deadlock { .. } => ErrorCode::Busy,
            Self::Corrupt { .. } | Self::WalCorrupt { .. } | Self::JournalCorrupt { .. } => {
                ErrorCode::Corrupt
            }
            Self::Cancelled => ErrorCode::Interrupt,
            Self::ReadOnly => ErrorCode::ReadOnly,
            Self::AccessDenied { .. } => ErrorCode::Perm,
            Self::Internal(_) => ErrorCode::Internal,
            Self::Unsupported => ErrorCode::Error,
        }
    }

    /// Whether retrying the enclosing transaction may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::Deadlock { .. })
    }

    /// Whether this is a caller bug rather than an environmental failure.
    ///
    /// Programming errors abort the enclosing transaction unconditionally;
    /// there is no recovery path short of fixing the caller.
    pub const fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPageId
                | Self::SizeMismatch { .. }
                | Self::LimitExceeded { .. }
                | Self::NoSuchSavepoint { .. }
                | Self::TxnNotActive { .. }
        )
    }

    /// Whether the database handle is unusable after this error.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::WalCorrupt { .. } | Self::JournalCorrupt { .. }
        )
    }

    /// Create an `InvalidFormat` error.
    pub fn invalid_format(detail: impl Into<String>) -> Self {
        Self::InvalidFormat {
            detail: detail.into(),
        }
    }

    /// Create a `Corrupt` error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create an `Internal` error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `StrataError`.
pub type Result<T> = std::result::Result<T, StrataError>;
