//! In-memory VFS.
//!
//! Backs `mode=memory` data sources and hermetic tests. Files live in a
//! registry shared by all clones of one [`MemoryVfs`]; handles opened from
//! the same registry observe each other's writes and contend on the same
//! five-level lock ladder, mirroring the on-disk semantics closely enough
//! that the pager and transaction layers cannot tell the difference.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_error::{Result, StrataError};
use strata_types::cx::Cx;
use strata_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use strata_types::LockLevel;

use crate::traits::{Vfs, VfsFile};

/// Aggregate lock state across every handle on one memory file.
#[derive(Debug, Default)]
struct MemLocks {
    n_shared: u32,
    n_reserved: u32,
    n_pending: u32,
    n_exclusive: u32,
}

#[derive(Debug, Default)]
struct MemNode {
    data: Mutex<Vec<u8>>,
    locks: Mutex<MemLocks>,
}

/// A VFS keeping all files in process memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryVfs {
    files: Arc<Mutex<HashMap<PathBuf, Arc<MemNode>>>>,
}

impl MemoryVfs {
    /// Create an empty in-memory filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files currently in the registry.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }
}

impl Vfs for MemoryVfs {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, cx: &Cx, path: &Path, flags: VfsOpenFlags) -> Result<Box<dyn VfsFile>> {
        cx.checkpoint()?;
        let mut files = self.files.lock();
        let node = match files.get(path) {
            Some(node) => {
                if flags.contains(VfsOpenFlags::CREATE) && flags.contains(VfsOpenFlags::EXCLUSIVE) {
                    return Err(StrataError::CannotOpen {
                        path: path.to_path_buf(),
                    });
                }
                Arc::clone(node)
            }
            None => {
                if !flags.contains(VfsOpenFlags::CREATE) {
                    return Err(StrataError::CannotOpen {
                        path: path.to_path_buf(),
                    });
                }
                let node = Arc::new(MemNode::default());
                files.insert(path.to_path_buf(), Arc::clone(&node));
                node
            }
        };
        drop(files);

        Ok(Box::new(MemFile {
            node,
            registry: Arc::clone(&self.files),
            path: path.to_path_buf(),
            held: LockLevel::None,
            delete_on_close: flags.contains(VfsOpenFlags::DELETE_ON_CLOSE),
        }))
    }

    fn delete(&self, cx: &Cx, path: &Path, _sync_dir: bool) -> Result<()> {
        cx.checkpoint()?;
        if self.files.lock().remove(path).is_none() {
            return Err(StrataError::Io(std::io::Error::from(
                std::io::ErrorKind::NotFound,
            )));
        }
        Ok(())
    }

    fn access(&self, cx: &Cx, path: &Path, _flags: AccessFlags) -> Result<bool> {
        cx.checkpoint()?;
        Ok(self.files.lock().contains_key(path))
    }

    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf> {
        cx.checkpoint()?;
        Ok(path.to_path_buf())
    }

    fn randomness(&self, _cx: &Cx, buf: &mut [u8]) {
        // Deterministic per-call stream; memory databases never survive the
        // process, so salt unpredictability buys nothing here.
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQ: AtomicU64 = AtomicU64::new(0x51_7C_C1_B7_27_22_0A_95);
        let mut state = SEQ.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
        for chunk in buf.chunks_mut(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            for (dst, src) in chunk.iter_mut().zip(state.to_le_bytes()) {
                *dst = src;
            }
        }
    }
}

/// A handle to a file inside a [`MemoryVfs`].
pub struct MemFile {
    node: Arc<MemNode>,
    registry: Arc<Mutex<HashMap<PathBuf, Arc<MemNode>>>>,
    path: PathBuf,
    held: LockLevel,
    delete_on_close: bool,
}

impl std::fmt::Debug for MemFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemFile")
            .field("path", &self.path)
            .field("held", &self.held)
            .field("delete_on_close", &self.delete_on_close)
            .finish()
    }
}

impl MemFile {
    fn downgrade_locked(held: &mut LockLevel, locks: &mut MemLocks, target: LockLevel) {
        if *held >= LockLevel::Exclusive && target < LockLevel::Exclusive {
            locks.n_exclusive = locks.n_exclusive.saturating_sub(1);
        }
        if *held >= LockLevel::Pending && target < LockLevel::Pending {
            locks.n_pending = locks.n_pending.saturating_sub(1);
        }
        if *held >= LockLevel::Reserved && target < LockLevel::Reserved {
            locks.n_reserved = locks.n_reserved.saturating_sub(1);
        }
        if *held >= LockLevel::Shared && target < LockLevel::Shared {
            locks.n_shared = locks.n_shared.saturating_sub(1);
        }
        *held = target;
    }
}

impl VfsFile for MemFile {
    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        cx.checkpoint()?;
        let data = self.node.data.lock();
        let offset = usize::try_from(offset).map_err(|_| StrataError::internal("offset overflow"))?;
        if offset >= data.len() {
            buf.fill(0);
            return Ok(0);
        }
        let available = data.len() - offset;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        buf[n..].fill(0);
        Ok(n)
    }

    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        cx.checkpoint()?;
        let mut data = self.node.data.lock();
        let offset = usize::try_from(offset).map_err(|_| StrataError::internal("offset overflow"))?;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        cx.checkpoint()?;
        let size = usize::try_from(size).map_err(|_| StrataError::internal("size overflow"))?;
        let mut data = self.node.data.lock();
        data.resize(size, 0);
        Ok(())
    }

    fn sync(&mut self, cx: &Cx, _flags: SyncFlags) -> Result<()> {
        cx.checkpoint()
    }

    fn file_size(&self, cx: &Cx) -> Result<u64> {
        cx.checkpoint()?;
        Ok(self.node.data.lock().len() as u64)
    }

    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        cx.checkpoint()?;
        if self.held >= level {
            return Ok(());
        }
        let mut locks = self.node.locks.lock();
        let original = self.held;

        if level >= LockLevel::Shared && self.held < LockLevel::Shared {
            if locks.n_pending > 0 || locks.n_exclusive > 0 {
                return Err(StrataError::Busy);
            }
            locks.n_shared += 1;
            self.held = LockLevel::Shared;
        }

        if level >= LockLevel::Reserved && self.held < LockLevel::Reserved {
            if locks.n_reserved > 0 || locks.n_pending > 0 || locks.n_exclusive > 0 {
                Self::downgrade_locked(&mut self.held, &mut locks, original);
                return Err(StrataError::Busy);
            }
            locks.n_reserved += 1;
            self.held = LockLevel::Reserved;
        }

        if level >= LockLevel::Pending && self.held < LockLevel::Pending {
            if locks.n_pending > 0 || locks.n_exclusive > 0 {
                Self::downgrade_locked(&mut self.held, &mut locks, original);
                return Err(StrataError::Busy);
            }
            locks.n_pending += 1;
            self.held = LockLevel::Pending;
        }

        if level >= LockLevel::Exclusive && self.held < LockLevel::Exclusive {
            // Only this handle's Shared may remain.
            if locks.n_shared > 1 {
                Self::downgrade_locked(&mut self.held, &mut locks, original);
                return Err(StrataError::Busy);
            }
            locks.n_exclusive += 1;
            self.held = LockLevel::Exclusive;
        }

        Ok(())
    }

    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        cx.checkpoint()?;
        let mut locks = self.node.locks.lock();
        Self::downgrade_locked(&mut self.held, &mut locks, level);
        Ok(())
    }

    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool> {
        cx.checkpoint()?;
        let locks = self.node.locks.lock();
        Ok(locks.n_reserved > 0 && self.held < LockLevel::Reserved)
    }

    fn close(&mut self, cx: &Cx) -> Result<()> {
        if self.held != LockLevel::None {
            self.unlock(cx, LockLevel::None)?;
        }
        if self.delete_on_close {
            self.registry.lock().remove(&self.path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_flags() -> VfsOpenFlags {
        VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE
    }

    #[test]
    fn write_then_read_through_second_handle() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("/mem/a.db");

        let mut w = vfs.open(&cx, path, create_flags()).unwrap();
        w.write(&cx, b"shared bytes", 0).unwrap();

        let mut r = vfs
            .open(&cx, path, VfsOpenFlags::MAIN_DB | VfsOpenFlags::READONLY)
            .unwrap();
        let mut buf = [0u8; 12];
        assert_eq!(r.read(&cx, &mut buf, 0).unwrap(), 12);
        assert_eq!(&buf, b"shared bytes");
    }

    #[test]
    fn read_past_end_zero_fills() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut f = vfs.open(&cx, Path::new("/m.db"), create_flags()).unwrap();
        f.write(&cx, b"xy", 0).unwrap();

        let mut buf = [0xAAu8; 6];
        assert_eq!(f.read(&cx, &mut buf, 0).unwrap(), 2);
        assert_eq!(&buf, &[b'x', b'y', 0, 0, 0, 0]);

        let mut buf = [0xAAu8; 4];
        assert_eq!(f.read(&cx, &mut buf, 100).unwrap(), 0);
        assert_eq!(&buf, &[0u8; 4]);
    }

    #[test]
    fn open_without_create_fails_for_missing() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        assert!(vfs
            .open(
                &cx,
                Path::new("/none.db"),
                VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE
            )
            .is_err());
    }

    #[test]
    fn delete_removes_file() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("/d.db");
        let mut f = vfs.open(&cx, path, create_flags()).unwrap();
        f.write(&cx, b"z", 0).unwrap();
        f.close(&cx).unwrap();

        assert!(vfs.access(&cx, path, AccessFlags::EXISTS).unwrap());
        vfs.delete(&cx, path, false).unwrap();
        assert!(!vfs.access(&cx, path, AccessFlags::EXISTS).unwrap());
    }

    #[test]
    fn second_reserved_is_busy() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("/locks.db");
        let mut a = vfs.open(&cx, path, create_flags()).unwrap();
        let mut b = vfs.open(&cx, path, create_flags()).unwrap();

        a.lock(&cx, LockLevel::Shared).unwrap();
        b.lock(&cx, LockLevel::Shared).unwrap();
        a.lock(&cx, LockLevel::Reserved).unwrap();

        assert!(matches!(
            b.lock(&cx, LockLevel::Reserved).unwrap_err(),
            StrataError::Busy
        ));
        // The failed escalation must not have disturbed b's shared lock.
        b.unlock(&cx, LockLevel::None).unwrap();
        a.unlock(&cx, LockLevel::None).unwrap();
    }

    #[test]
    fn exclusive_blocked_by_other_reader() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("/excl.db");
        let mut writer = vfs.open(&cx, path, create_flags()).unwrap();
        let mut reader = vfs.open(&cx, path, create_flags()).unwrap();

        writer.lock(&cx, LockLevel::Shared).unwrap();
        reader.lock(&cx, LockLevel::Shared).unwrap();
        writer.lock(&cx, LockLevel::Reserved).unwrap();

        // Reader still holds Shared: writer stalls at Exclusive but keeps
        // Pending, which now blocks new readers.
        assert!(matches!(
            writer.lock(&cx, LockLevel::Exclusive).unwrap_err(),
            StrataError::Busy
        ));
        writer.lock(&cx, LockLevel::Pending).unwrap();

        let mut late = vfs.open(&cx, path, create_flags()).unwrap();
        assert!(matches!(
            late.lock(&cx, LockLevel::Shared).unwrap_err(),
            StrataError::Busy
        ));

        // Reader drains; writer gets Exclusive.
        reader.unlock(&cx, LockLevel::None).unwrap();
        writer.lock(&cx, LockLevel::Exclusive).unwrap();
        writer.unlock(&cx, LockLevel::None).unwrap();
    }

    #[test]
    fn check_reserved_lock_reports_foreign_writer() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let path = Path::new("/cr.db");
        let mut a = vfs.open(&cx, path, create_flags()).unwrap();
        let b = vfs.open(&cx, path, create_flags()).unwrap();

        assert!(!b.check_reserved_lock(&cx).unwrap());
        a.lock(&cx, LockLevel::Reserved).unwrap();
        assert!(b.check_reserved_lock(&cx).unwrap());
        assert!(!a.check_reserved_lock(&cx).unwrap());
        a.unlock(&cx, LockLevel::None).unwrap();
    }

    #[test]
    fn truncate_and_size() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let mut f = vfs.open(&cx, Path::new("/t.db"), create_flags()).unwrap();
        f.write(&cx, &[1u8; 64], 0).unwrap();
        assert_eq!(f.file_size(&cx).unwrap(), 64);
        f.truncate(&cx, 16).unwrap();
        assert_eq!(f.file_size(&cx).unwrap(), 16);
        f.truncate(&cx, 32).unwrap();
        assert_eq!(f.file_size(&cx).unwrap(), 32);
        let mut buf = [0xFFu8; 32];
        f.read(&cx, &mut buf, 0).unwrap();
        assert!(buf[16..].iter().all(|&b| b == 0));
    }
}
