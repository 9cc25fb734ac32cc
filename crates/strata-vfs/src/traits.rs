//! The VFS boundary: the only polymorphic seam inside the storage core.
//!
//! Everything above this layer reasons about byte offsets and lock levels;
//! everything below maps those onto a real filesystem, an in-memory store,
//! or a sandboxed view of one. Both traits are object-safe so a database
//! handle can carry `Arc<dyn Vfs>` / `Box<dyn VfsFile>` picked at open time.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use strata_error::Result;
use strata_types::cx::Cx;
use strata_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use strata_types::LockLevel;

/// A virtual filesystem implementation.
pub trait Vfs: Send + Sync {
    /// The name of this VFS (e.g. "unix", "memory", "sandbox").
    fn name(&self) -> &'static str;

    /// Open a file. `flags` describes the file's role (main db, journal,
    /// WAL) and how to open it. Returns the opened handle.
    fn open(&self, cx: &Cx, path: &Path, flags: VfsOpenFlags) -> Result<Box<dyn VfsFile>>;

    /// Delete a file. If `sync_dir` is true, the directory entry removal
    /// is synced for durability.
    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()>;

    /// Probe file access. Returns true when `path` satisfies `flags`.
    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool>;

    /// Resolve a potentially relative path into an absolute one.
    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf>;

    /// Fill `buf` with randomness suitable for salts and nonces.
    fn randomness(&self, cx: &Cx, buf: &mut [u8]);

    /// Current wall-clock time.
    fn current_time(&self, cx: &Cx) -> SystemTime {
        let _ = cx;
        SystemTime::now()
    }
}

/// A file handle opened by a [`Vfs`].
pub trait VfsFile: Send + std::fmt::Debug {
    /// Read up to `buf.len()` bytes at byte `offset`.
    ///
    /// Returns the number of bytes actually read; a short count means EOF
    /// was reached. Bytes past the count are zero-filled so callers that
    /// treat missing pages as zeroed can use the buffer directly.
    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write all of `buf` at byte `offset`, retrying partial writes.
    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()>;

    /// Durably flush file contents (and metadata unless `DATAONLY`).
    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()>;

    /// Current file size in bytes.
    fn file_size(&self, cx: &Cx) -> Result<u64>;

    /// Escalate the file lock to `level` (non-blocking; `Busy` on
    /// contention). Levels follow the five-state ladder and requests below
    /// the currently held level are no-ops.
    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Downgrade the file lock to `level`.
    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Whether another connection holds a RESERVED or higher lock.
    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool>;

    /// Minimum write granularity of the underlying storage.
    fn sector_size(&self) -> u32 {
        4096
    }

    /// Release the handle; locks drop to `None`.
    fn close(&mut self, cx: &Cx) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _accepts_vfs(_v: &dyn Vfs) {}
        fn _accepts_file(_f: &mut dyn VfsFile) {}
    }
}
