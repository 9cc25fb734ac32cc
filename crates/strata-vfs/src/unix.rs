//! Real-filesystem VFS with POSIX fcntl five-level locking.
//!
//! The lock protocol matches the deployed single-file format so independent
//! processes (including third-party tooling) interoperate on the same
//! database file:
//!
//! - `PENDING_BYTE`  = `0x4000_0000` (1 byte)
//! - `RESERVED_BYTE` = `0x4000_0001` (1 byte)
//! - `SHARED_FIRST`  = `0x4000_0002` (510 bytes)
//!
//! POSIX fcntl locks are per-process, not per-fd: closing *any* descriptor
//! for a file drops every lock the process holds on it. All handles to one
//! inode therefore share a single canonical descriptor through a global
//! inode table, and OS lock calls are issued only when the first handle
//! acquires or the last handle releases a level.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use strata_error::{Result, StrataError};
use strata_types::cx::Cx;
use strata_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use strata_types::LockLevel;
use tracing::trace;

use crate::traits::{Vfs, VfsFile};

/// Byte offset of the pending lock byte.
const PENDING_BYTE: u64 = 0x4000_0000;
/// Byte offset of the reserved lock byte.
const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
/// Byte offset of the first shared lock byte.
const SHARED_FIRST: u64 = PENDING_BYTE + 2;
/// Length of the shared lock range.
const SHARED_SIZE: u64 = 510;

/// Attempt a non-blocking advisory lock via `fcntl(F_SETLK)`.
///
/// Returns `Ok(true)` on success, `Ok(false)` when a conflicting lock is
/// held elsewhere, and `Err` for real I/O failures.
#[allow(clippy::cast_possible_wrap)]
fn fcntl_lock(file: &impl AsFd, lock_type: i32, start: u64, len: u64) -> Result<bool> {
    let flock = libc::flock {
        l_type: i16::try_from(lock_type).expect("fcntl lock type fits i16"),
        l_whence: i16::try_from(libc::SEEK_SET).expect("SEEK_SET fits i16"),
        l_start: start as libc::off_t,
        l_len: len as libc::off_t,
        l_pid: 0,
    };
    match nix::fcntl::fcntl(
        file.as_fd().as_raw_fd(),
        nix::fcntl::FcntlArg::F_SETLK(&flock),
    ) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
        Err(e) => Err(StrataError::Io(e.into())),
    }
}

fn fcntl_unlock(file: &impl AsFd, start: u64, len: u64) -> Result<()> {
    let ok = fcntl_lock(file, libc::F_UNLCK, start, len)?;
    debug_assert!(ok, "F_UNLCK never reports contention");
    Ok(())
}

/// Identity of an open file: (device, inode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InodeKey {
    dev: u64,
    ino: u64,
}

/// Per-inode state shared by every handle in this process.
#[derive(Debug)]
struct InodeState {
    /// The canonical descriptor all lock calls go through.
    file: Arc<File>,
    /// Handles holding at least SHARED.
    n_shared: u32,
    /// Handles holding at least RESERVED.
    n_reserved: u32,
    /// Handles holding at least PENDING.
    n_pending: u32,
    /// Handles holding EXCLUSIVE.
    n_exclusive: u32,
    /// Open handles referencing this inode.
    n_ref: u32,
}

impl InodeState {
    fn new(file: Arc<File>) -> Self {
        Self {
            file,
            n_shared: 0,
            n_reserved: 0,
            n_pending: 0,
            n_exclusive: 0,
            n_ref: 0,
        }
    }
}

struct InodeTable {
    map: Mutex<HashMap<InodeKey, Arc<Mutex<InodeState>>>>,
}

impl InodeTable {
    fn get_or_insert(&self, key: InodeKey, file: &Arc<File>) -> Arc<Mutex<InodeState>> {
        let mut map = self.map.lock();
        Arc::clone(
            map.entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(InodeState::new(Arc::clone(file))))),
        )
    }

    fn lookup(&self, key: InodeKey) -> Option<Arc<Mutex<InodeState>>> {
        self.map.lock().get(&key).cloned()
    }

    fn release_if_unused(&self, key: InodeKey) {
        let mut map = self.map.lock();
        if let Some(state) = map.get(&key) {
            if state.lock().n_ref == 0 {
                map.remove(&key);
            }
        }
    }
}

fn inode_table() -> &'static InodeTable {
    static TABLE: OnceLock<InodeTable> = OnceLock::new();
    TABLE.get_or_init(|| InodeTable {
        map: Mutex::new(HashMap::new()),
    })
}

fn inode_key(file: &File) -> Result<InodeKey> {
    let meta = file.metadata().map_err(StrataError::Io)?;
    Ok(InodeKey {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

/// A VFS backed by the real Unix filesystem.
#[derive(Debug, Default)]
pub struct UnixVfs;

impl UnixVfs {
    /// Create a new Unix VFS instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Vfs for UnixVfs {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn open(&self, cx: &Cx, path: &Path, flags: VfsOpenFlags) -> Result<Box<dyn VfsFile>> {
        cx.checkpoint()?;

        // Reuse the canonical in-process descriptor when the inode is
        // already open, so fcntl state stays coherent.
        if let Ok(meta) = fs::metadata(path) {
            let key = InodeKey {
                dev: meta.dev(),
                ino: meta.ino(),
            };
            if let Some(state) = inode_table().lookup(key) {
                let file = {
                    let mut guard = state.lock();
                    guard.n_ref += 1;
                    Arc::clone(&guard.file)
                };
                return Ok(Box::new(UnixFile {
                    file,
                    path: path.to_path_buf(),
                    held: LockLevel::None,
                    delete_on_close: flags.contains(VfsOpenFlags::DELETE_ON_CLOSE),
                    inode: key,
                    state,
                }));
            }
        }

        let create = flags.contains(VfsOpenFlags::CREATE);
        let writable = create || flags.contains(VfsOpenFlags::READWRITE);
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(create)
            .create_new(create && flags.contains(VfsOpenFlags::EXCLUSIVE))
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StrataError::CannotOpen {
                        path: path.to_path_buf(),
                    }
                } else {
                    StrataError::Io(e)
                }
            })?;

        let file = Arc::new(file);
        let key = inode_key(&file)?;
        let state = inode_table().get_or_insert(key, &file);
        let file = {
            let mut guard = state.lock();
            guard.n_ref += 1;
            Arc::clone(&guard.file)
        };

        Ok(Box::new(UnixFile {
            file,
            path: path.to_path_buf(),
            held: LockLevel::None,
            delete_on_close: flags.contains(VfsOpenFlags::DELETE_ON_CLOSE),
            inode: key,
            state,
        }))
    }

    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()> {
        cx.checkpoint()?;
        fs::remove_file(path).map_err(StrataError::Io)?;
        if sync_dir {
            if let Some(parent) = path.parent() {
                if let Ok(dir) = File::open(parent) {
                    drop(dir.sync_all());
                }
            }
        }
        Ok(())
    }

    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool> {
        cx.checkpoint()?;
        if flags.contains(AccessFlags::READWRITE) {
            return match fs::metadata(path) {
                Ok(meta) => Ok(!meta.permissions().readonly()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(StrataError::Io(e)),
            };
        }
        Ok(path.exists())
    }

    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf> {
        cx.checkpoint()?;
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            let cwd = std::env::current_dir().map_err(StrataError::Io)?;
            Ok(cwd.join(path))
        }
    }

    fn randomness(&self, _cx: &Cx, buf: &mut [u8]) {
        // /dev/urandom, with a deterministic xorshift fallback for hermetic
        // environments without it.
        if let Ok(mut f) = File::open("/dev/urandom") {
            if f.read_exact(buf).is_ok() {
                return;
            }
        }
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
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

/// A file handle opened by [`UnixVfs`].
pub struct UnixFile {
    file: Arc<File>,
    path: PathBuf,
    held: LockLevel,
    delete_on_close: bool,
    inode: InodeKey,
    state: Arc<Mutex<InodeState>>,
}

impl std::fmt::Debug for UnixFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixFile")
            .field("path", &self.path)
            .field("held", &self.held)
            .field("delete_on_close", &self.delete_on_close)
            .finish()
    }
}

impl UnixFile {
    /// Downgrade this handle to `target`, issuing OS unlocks only when the
    /// last in-process holder of a level drops it.
    fn downgrade(
        held: &mut LockLevel,
        state: &mut InodeState,
        file: &File,
        target: LockLevel,
    ) -> Result<()> {
        if *held <= target {
            *held = target;
            return Ok(());
        }

        if *held == LockLevel::Exclusive && target < LockLevel::Exclusive {
            state.n_exclusive = state.n_exclusive.saturating_sub(1);
            if state.n_exclusive == 0 {
                // Put the shared range back to a read lock.
                if !fcntl_lock(file, libc::F_RDLCK, SHARED_FIRST, SHARED_SIZE)? {
                    return Err(StrataError::Busy);
                }
            }
        }
        if *held >= LockLevel::Pending && target < LockLevel::Pending {
            state.n_pending = state.n_pending.saturating_sub(1);
            if state.n_pending == 0 {
                fcntl_unlock(file, PENDING_BYTE, 1)?;
            }
        }
        if *held >= LockLevel::Reserved && target < LockLevel::Reserved {
            state.n_reserved = state.n_reserved.saturating_sub(1);
            if state.n_reserved == 0 {
                fcntl_unlock(file, RESERVED_BYTE, 1)?;
            }
        }
        if *held >= LockLevel::Shared && target < LockLevel::Shared {
            state.n_shared = state.n_shared.saturating_sub(1);
            if state.n_shared == 0 {
                fcntl_unlock(file, SHARED_FIRST, SHARED_SIZE)?;
            }
        }

        *held = target;
        Ok(())
    }
}

impl VfsFile for UnixFile {
    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        cx.checkpoint()?;
        let mut total = 0usize;
        while total < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[total..], offset + total as u64)
                .map_err(StrataError::Io)?;
            if n == 0 {
                break; // EOF
            }
            total += n;
        }
        if total < buf.len() {
            buf[total..].fill(0);
        }
        Ok(total)
    }

    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        cx.checkpoint()?;
        let mut total = 0usize;
        while total < buf.len() {
            let n = self
                .file
                .write_at(&buf[total..], offset + total as u64)
                .map_err(StrataError::Io)?;
            if n == 0 {
                return Err(StrataError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write_at returned 0",
                )));
            }
            total += n;
        }
        Ok(())
    }

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        cx.checkpoint()?;
        self.file.set_len(size).map_err(StrataError::Io)
    }

    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()> {
        cx.checkpoint()?;
        if flags.contains(SyncFlags::DATAONLY) {
            self.file.sync_data().map_err(StrataError::Io)
        } else {
            self.file.sync_all().map_err(StrataError::Io)
        }
    }

    fn file_size(&self, cx: &Cx) -> Result<u64> {
        cx.checkpoint()?;
        Ok(self.file.metadata().map_err(StrataError::Io)?.len())
    }

    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        cx.checkpoint()?;
        if self.held >= level {
            return Ok(());
        }
        trace!(path = %self.path.display(), from = ?self.held, to = ?level, "file lock");

        let file = Arc::clone(&self.file);
        let mut state = self.state.lock();
        let original = self.held;

        // Conflicts with sibling handles in this process are decided
        // against the inode counts — the kernel cannot arbitrate them,
        // because all handles share one descriptor.
        if level >= LockLevel::Shared && self.held < LockLevel::Shared {
            if state.n_pending > 0 || state.n_exclusive > 0 {
                return Err(StrataError::Busy);
            }
            if state.n_shared == 0 {
                // A write-locked PENDING byte means a writer elsewhere is
                // draining readers; new readers must not slip in.
                if !fcntl_lock(&*file, libc::F_RDLCK, PENDING_BYTE, 1)? {
                    return Err(StrataError::Busy);
                }
                if !fcntl_lock(&*file, libc::F_RDLCK, SHARED_FIRST, SHARED_SIZE)? {
                    fcntl_unlock(&*file, PENDING_BYTE, 1)?;
                    return Err(StrataError::Busy);
                }
                fcntl_unlock(&*file, PENDING_BYTE, 1)?;
            }
            state.n_shared += 1;
            self.held = LockLevel::Shared;
        }

        if level >= LockLevel::Reserved && self.held < LockLevel::Reserved {
            if state.n_reserved > 0
                || state.n_pending > 0
                || state.n_exclusive > 0
                || !fcntl_lock(&*file, libc::F_WRLCK, RESERVED_BYTE, 1)?
            {
                Self::downgrade(&mut self.held, &mut state, &file, original)?;
                return Err(StrataError::Busy);
            }
            state.n_reserved += 1;
            self.held = LockLevel::Reserved;
        }

        if level >= LockLevel::Pending && self.held < LockLevel::Pending {
            if state.n_pending > 0
                || state.n_exclusive > 0
                || !fcntl_lock(&*file, libc::F_WRLCK, PENDING_BYTE, 1)?
            {
                Self::downgrade(&mut self.held, &mut state, &file, original)?;
                return Err(StrataError::Busy);
            }
            state.n_pending += 1;
            self.held = LockLevel::Pending;
        }

        if level >= LockLevel::Exclusive && self.held < LockLevel::Exclusive {
            // n_shared counts this handle too; any second reader blocks.
            if state.n_exclusive > 0
                || state.n_shared > 1
                || !fcntl_lock(&*file, libc::F_WRLCK, SHARED_FIRST, SHARED_SIZE)?
            {
                Self::downgrade(&mut self.held, &mut state, &file, original)?;
                return Err(StrataError::Busy);
            }
            state.n_exclusive += 1;
            self.held = LockLevel::Exclusive;
        }

        Ok(())
    }

    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        cx.checkpoint()?;
        let file = Arc::clone(&self.file);
        let mut state = self.state.lock();
        Self::downgrade(&mut self.held, &mut state, &file, level)
    }

    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool> {
        cx.checkpoint()?;
        {
            let state = self.state.lock();
            if state.n_reserved > 0 {
                // Held within this process; not a foreign writer.
                return Ok(false);
            }
        }
        let file = Arc::clone(&self.file);
        if fcntl_lock(&*file, libc::F_WRLCK, RESERVED_BYTE, 1)? {
            fcntl_unlock(&*file, RESERVED_BYTE, 1)?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn close(&mut self, cx: &Cx) -> Result<()> {
        if self.held != LockLevel::None {
            self.unlock(cx, LockLevel::None)?;
        }
        {
            let mut state = self.state.lock();
            state.n_ref = state.n_ref.saturating_sub(1);
        }
        inode_table().release_if_unused(self.inode);
        if self.delete_on_close {
            drop(fs::remove_file(&self.path));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        (dir, path)
    }

    fn create_flags() -> VfsOpenFlags {
        VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE
    }

    #[test]
    fn write_close_reopen_read() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("rw.db");

        let mut file = vfs.open(&cx, &path, create_flags()).unwrap();
        file.write(&cx, b"stratadb vfs", 0).unwrap();
        assert_eq!(file.file_size(&cx).unwrap(), 12);
        file.close(&cx).unwrap();

        let mut file = vfs
            .open(&cx, &path, VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE)
            .unwrap();
        let mut buf = [0u8; 12];
        assert_eq!(file.read(&cx, &mut buf, 0).unwrap(), 12);
        assert_eq!(&buf, b"stratadb vfs");
        file.close(&cx).unwrap();
    }

    #[test]
    fn short_read_zero_fills() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("short.db");

        let mut file = vfs.open(&cx, &path, create_flags()).unwrap();
        file.write(&cx, b"ab", 0).unwrap();

        let mut buf = [0xFFu8; 8];
        let n = file.read(&cx, &mut buf, 0).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"ab");
        assert!(buf[2..].iter().all(|&b| b == 0));
        file.close(&cx).unwrap();
    }

    #[test]
    fn truncate_shrinks() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("trunc.db");

        let mut file = vfs.open(&cx, &path, create_flags()).unwrap();
        file.write(&cx, &[7u8; 100], 0).unwrap();
        file.truncate(&cx, 10).unwrap();
        assert_eq!(file.file_size(&cx).unwrap(), 10);
        file.close(&cx).unwrap();
    }

    #[test]
    fn open_missing_without_create_fails() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("missing.db");
        let err = vfs
            .open(&cx, &path, VfsOpenFlags::MAIN_DB | VfsOpenFlags::READWRITE)
            .unwrap_err();
        assert!(matches!(err, StrataError::CannotOpen { .. }));
    }

    #[test]
    fn lock_ladder_escalate_and_downgrade() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("locks.db");

        let mut file = vfs.open(&cx, &path, create_flags()).unwrap();
        file.write(&cx, b"payload", 0).unwrap();

        file.lock(&cx, LockLevel::Shared).unwrap();
        file.lock(&cx, LockLevel::Reserved).unwrap();
        file.lock(&cx, LockLevel::Exclusive).unwrap();

        file.unlock(&cx, LockLevel::Shared).unwrap();
        file.unlock(&cx, LockLevel::None).unwrap();
        file.close(&cx).unwrap();
    }

    #[test]
    fn lock_is_idempotent_at_level() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("idem.db");

        let mut file = vfs.open(&cx, &path, create_flags()).unwrap();
        file.lock(&cx, LockLevel::Shared).unwrap();
        file.lock(&cx, LockLevel::Shared).unwrap();
        file.unlock(&cx, LockLevel::None).unwrap();
        file.close(&cx).unwrap();
    }

    #[test]
    fn check_reserved_sees_own_process_as_clear() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("resv.db");

        let mut file = vfs.open(&cx, &path, create_flags()).unwrap();
        assert!(!file.check_reserved_lock(&cx).unwrap());
        file.lock(&cx, LockLevel::Reserved).unwrap();
        assert!(!file.check_reserved_lock(&cx).unwrap());
        file.unlock(&cx, LockLevel::None).unwrap();
        file.close(&cx).unwrap();
    }

    #[test]
    fn delete_on_close_removes_file() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("tmp.db");

        let mut file = vfs
            .open(&cx, &path, create_flags() | VfsOpenFlags::DELETE_ON_CLOSE)
            .unwrap();
        file.write(&cx, b"x", 0).unwrap();
        assert!(path.exists());
        file.close(&cx).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn randomness_differs_between_calls() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        vfs.randomness(&cx, &mut a);
        vfs.randomness(&cx, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn cancelled_cx_stops_io() {
        let cx = Cx::new();
        let vfs = UnixVfs::new();
        let (_dir, path) = temp_db("cancel.db");
        let mut file = vfs.open(&cx, &path, create_flags()).unwrap();

        cx.cancel();
        assert!(matches!(
            file.write(&cx, b"nope", 0).unwrap_err(),
            StrataError::Cancelled
        ));
    }
}
