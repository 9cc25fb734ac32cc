//! Hard limits and on-disk size constants.

/// Size of the database file header on page 1.
pub const DATABASE_HEADER_SIZE: usize = 100;

/// Minimum database page size in bytes.
pub const MIN_PAGE_SIZE: u32 = 512;

/// Default database page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Maximum database page size in bytes (encoded as 1 in the header field).
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Default cap on savepoint stack depth per transaction.
pub const DEFAULT_MAX_SAVEPOINT_DEPTH: usize = 512;

/// Default busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Base delay for lock-contention backoff, in milliseconds.
pub const BUSY_BACKOFF_BASE_MS: u64 = 1;

/// Cap on a single lock-contention backoff step, in milliseconds.
pub const BUSY_BACKOFF_CAP_MS: u64 = 100;

/// Default resident-page capacity for the pager cache.
pub const DEFAULT_CACHE_PAGES: usize = 1024;
