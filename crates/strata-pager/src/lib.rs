pub mod arc_cache;
pub mod journal;
pub mod pager;

pub use arc_cache::{ArcCache, CacheStats, Lookup};
pub use journal::{JournalFile, JournalHeader, JournalRecord};
pub use pager::Pager;
