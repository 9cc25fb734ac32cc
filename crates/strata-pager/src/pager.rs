//! The pager: maps page numbers to file offsets, caches hot pages, stages
//! writes as dirty entries, and flushes them in ascending page order.
//!
//! Locking discipline: one mutex guards the cache, dirty set, and logical
//! size; a second guards the file handle. Miss reads drop the state mutex
//! while the disk read runs, so concurrent misses on different pages
//! overlap. Published payloads are immutable `Arc<PageData>` — a write
//! installs a fresh buffer.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_error::{Result, StrataError};
use strata_types::cx::Cx;
use strata_types::flags::SyncFlags;
use strata_types::{PageData, PageNumber, PageSize};
use strata_vfs::VfsFile;
use tracing::debug;

use crate::arc_cache::{ArcCache, CacheStats, Lookup};

struct PagerState {
    cache: ArcCache,
    /// Dirty pages with their current payloads. A `BTreeMap` so flushing
    /// walks ascending page order without sorting.
    dirty: BTreeMap<PageNumber, Arc<PageData>>,
    /// Logical database size in pages.
    db_size: u32,
}

/// A page-granular view of one database file.
pub struct Pager {
    file: Mutex<Box<dyn VfsFile>>,
    state: Mutex<PagerState>,
    page_size: PageSize,
}

impl Pager {
    /// Wrap an open database file.
    ///
    /// `db_size` comes from the parsed header (or 0 for a fresh file);
    /// `cache_pages` bounds the resident set.
    pub fn new(
        file: Box<dyn VfsFile>,
        page_size: PageSize,
        db_size: u32,
        cache_pages: usize,
    ) -> Self {
        Self {
            file: Mutex::new(file),
            state: Mutex::new(PagerState {
                cache: ArcCache::new(cache_pages),
                dirty: BTreeMap::new(),
                db_size,
            }),
            page_size,
        }
    }

    /// The database page size.
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Snapshot of the logical database size in pages.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.state.lock().db_size
    }

    /// Set the logical size (recovery and commit bookkeeping).
    pub fn set_page_count(&self, pages: u32) {
        self.state.lock().db_size = pages;
    }

    /// Number of dirty pages currently staged.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    /// Cache statistics snapshot.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.state.lock().cache.stats()
    }

    /// Read a page, cache-first. Reads past EOF return a zero-filled page.
    pub fn get_page(&self, cx: &Cx, id: PageNumber) -> Result<Arc<PageData>> {
        cx.checkpoint()?;

        let lookup = {
            let mut state = self.state.lock();
            if let Some(data) = state.dirty.get(&id) {
                return Ok(Arc::clone(data));
            }
            let outcome = state.cache.request(id);
            if outcome == Lookup::Hit {
                return Ok(state
                    .cache
                    .peek(id)
                    .expect("hit entries have a payload"));
            }
            outcome
        };

        // Miss path: read with the state mutex released.
        let data = Arc::new(self.read_from_file(cx, id)?);

        let mut state = self.state.lock();
        state.cache.admit(id, Arc::clone(&data), lookup);
        Ok(data)
    }

    /// Stage a page write. Takes a defensive copy; the caller may reuse its
    /// buffer afterwards.
    pub fn write_page(&self, cx: &Cx, id: PageNumber, bytes: &[u8]) -> Result<()> {
        cx.checkpoint()?;
        if bytes.len() != self.page_size.as_usize() {
            return Err(StrataError::SizeMismatch {
                expected: self.page_size.as_usize(),
                actual: bytes.len(),
            });
        }

        let data = Arc::new(PageData::from_vec(bytes.to_vec()));
        let mut state = self.state.lock();
        state.cache.install(id, Arc::clone(&data));
        state.dirty.insert(id, data);
        if id.get() > state.db_size {
            state.db_size = id.get();
        }
        Ok(())
    }

    /// Write every dirty page to the main file in ascending page order,
    /// sync, then clear the dirty set.
    ///
    /// Callers serialize at the transaction boundary; concurrent mutation
    /// of the same pages during a flush is a caller bug.
    pub fn flush_dirty(&self, cx: &Cx) -> Result<()> {
        self.flush_dirty_with_sync(cx, true)
    }

    /// [`Self::flush_dirty`] with the trailing sync made optional, for
    /// `synchronous=OFF` commits.
    pub fn flush_dirty_with_sync(&self, cx: &Cx, sync: bool) -> Result<()> {
        let snapshot: Vec<(PageNumber, Arc<PageData>)> = {
            let state = self.state.lock();
            state
                .dirty
                .iter()
                .map(|(id, data)| (*id, Arc::clone(data)))
                .collect()
        };
        if snapshot.is_empty() {
            return Ok(());
        }

        {
            let mut file = self.file.lock();
            for (id, data) in &snapshot {
                cx.checkpoint()?;
                file.write(cx, data.as_bytes(), id.file_offset(self.page_size))?;
            }
            if sync {
                file.sync(cx, SyncFlags::FULL)?;
            }
        }
        debug!(pages = snapshot.len(), "flushed dirty pages");

        let mut state = self.state.lock();
        for (id, _) in snapshot {
            state.dirty.remove(&id);
        }
        Ok(())
    }

    /// Drop all staged writes without touching the file (WAL-mode rollback,
    /// where the main file was never modified).
    pub fn discard_dirty(&self) {
        let mut state = self.state.lock();
        let stale: Vec<PageNumber> = state.dirty.keys().copied().collect();
        state.dirty.clear();
        // Cached entries for those pages hold post-write images; drop them
        // so the next read goes back to the authoritative bytes.
        for id in stale {
            state.cache.invalidate(id);
        }
    }

    /// Write a page image straight to the file and publish it clean in the
    /// cache. Used by rollback replay, checkpoint backfill, and recovery —
    /// paths where the image is already durable-ordered by the caller.
    pub fn apply_page_image(&self, cx: &Cx, id: PageNumber, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.page_size.as_usize() {
            return Err(StrataError::SizeMismatch {
                expected: self.page_size.as_usize(),
                actual: bytes.len(),
            });
        }
        {
            let mut file = self.file.lock();
            file.write(cx, bytes, id.file_offset(self.page_size))?;
        }
        let data = Arc::new(PageData::from_vec(bytes.to_vec()));
        let mut state = self.state.lock();
        state.dirty.remove(&id);
        state.cache.install(id, data);
        if id.get() > state.db_size {
            state.db_size = id.get();
        }
        Ok(())
    }

    /// Drop every cached page. Used when another handle committed to the
    /// same file and this cache can no longer be trusted.
    pub fn reset_cache(&self) {
        let mut state = self.state.lock();
        debug_assert!(
            state.dirty.is_empty(),
            "cache reset with staged writes would lose them"
        );
        state.cache.clear();
    }

    /// Sync the main file.
    pub fn sync(&self, cx: &Cx) -> Result<()> {
        self.file.lock().sync(cx, SyncFlags::FULL)
    }

    /// Truncate the main file to `pages` pages and drop newer cache state.
    pub fn truncate(&self, cx: &Cx, pages: u32) -> Result<()> {
        {
            let mut file = self.file.lock();
            file.truncate(cx, u64::from(pages) * u64::from(self.page_size.get()))?;
        }
        let mut state = self.state.lock();
        state.db_size = pages;
        let stale: Vec<PageNumber> = state
            .dirty
            .keys()
            .copied()
            .filter(|id| id.get() > pages)
            .collect();
        for id in stale {
            state.dirty.remove(&id);
        }
        Ok(())
    }

    /// Run `f` with the underlying file handle (lock acquisition, size
    /// probes). The pager state mutex is not held.
    pub fn with_file<R>(&self, f: impl FnOnce(&mut dyn VfsFile) -> Result<R>) -> Result<R> {
        let mut file = self.file.lock();
        f(file.as_mut())
    }

    /// Flush dirty pages and release the file handle.
    pub fn close(&self, cx: &Cx) -> Result<()> {
        self.flush_dirty(cx)?;
        self.file.lock().close(cx)
    }

    fn read_from_file(&self, cx: &Cx, id: PageNumber) -> Result<PageData> {
        let mut data = PageData::zeroed(self.page_size);
        let mut file = self.file.lock();
        // Short reads (page beyond EOF) leave the zero fill in place.
        let _ = file.read(cx, data.as_bytes_mut(), id.file_offset(self.page_size))?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::flags::VfsOpenFlags;
    use strata_vfs::{MemoryVfs, Vfs};

    const PS: PageSize = PageSize::MIN; // 512 keeps fixtures small

    fn pg(n: u32) -> PageNumber {
        PageNumber::new(n).unwrap()
    }

    fn mem_pager(vfs: &MemoryVfs, name: &str) -> Pager {
        let cx = Cx::new();
        let file = vfs
            .open(
                &cx,
                std::path::Path::new(name),
                VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE,
            )
            .unwrap();
        Pager::new(file, PS, 0, 16)
    }

    #[test]
    fn get_page_past_eof_is_zero_filled() {
        let vfs = MemoryVfs::new();
        let pager = mem_pager(&vfs, "/z.db");
        let cx = Cx::new();

        let page = pager.get_page(&cx, pg(5)).unwrap();
        assert_eq!(page.len(), PS.as_usize());
        assert!(page.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_back_through_cache() {
        let vfs = MemoryVfs::new();
        let pager = mem_pager(&vfs, "/w.db");
        let cx = Cx::new();

        pager.write_page(&cx, pg(2), &[0x41; 512]).unwrap();
        let got = pager.get_page(&cx, pg(2)).unwrap();
        assert!(got.as_bytes().iter().all(|&b| b == 0x41));
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.dirty_count(), 1);
    }

    #[test]
    fn write_page_rejects_wrong_size() {
        let vfs = MemoryVfs::new();
        let pager = mem_pager(&vfs, "/s.db");
        let cx = Cx::new();

        let err = pager.write_page(&cx, pg(1), &[0u8; 100]).unwrap_err();
        assert!(matches!(err, StrataError::SizeMismatch { expected: 512, actual: 100 }));
    }

    #[test]
    fn flush_writes_ascending_and_clears_dirty() {
        let vfs = MemoryVfs::new();
        let pager = mem_pager(&vfs, "/f.db");
        let cx = Cx::new();

        pager.write_page(&cx, pg(3), &[3u8; 512]).unwrap();
        pager.write_page(&cx, pg(1), &[1u8; 512]).unwrap();
        pager.write_page(&cx, pg(2), &[2u8; 512]).unwrap();
        pager.flush_dirty(&cx).unwrap();
        assert_eq!(pager.dirty_count(), 0);

        // Reopen through a second handle and verify the bytes landed.
        let pager2 = mem_pager(&vfs, "/f.db");
        for n in 1..=3u32 {
            let got = pager2.get_page(&cx, pg(n)).unwrap();
            assert!(got.as_bytes().iter().all(|&b| b == n as u8), "page {n}");
        }
    }

    #[test]
    fn defensive_copy_isolates_caller_buffer() {
        let vfs = MemoryVfs::new();
        let pager = mem_pager(&vfs, "/d.db");
        let cx = Cx::new();

        let mut buf = vec![0xAA; 512];
        pager.write_page(&cx, pg(1), &buf).unwrap();
        buf.fill(0xBB); // caller reuses the buffer
        let got = pager.get_page(&cx, pg(1)).unwrap();
        assert!(got.as_bytes().iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn discard_dirty_restores_disk_view() {
        let vfs = MemoryVfs::new();
        let pager = mem_pager(&vfs, "/r.db");
        let cx = Cx::new();

        pager.write_page(&cx, pg(1), &[0x11; 512]).unwrap();
        pager.flush_dirty(&cx).unwrap();

        pager.write_page(&cx, pg(1), &[0x22; 512]).unwrap();
        pager.discard_dirty();
        let got = pager.get_page(&cx, pg(1)).unwrap();
        assert!(got.as_bytes().iter().all(|&b| b == 0x11));
    }

    #[test]
    fn apply_page_image_is_clean() {
        let vfs = MemoryVfs::new();
        let pager = mem_pager(&vfs, "/a.db");
        let cx = Cx::new();

        pager.apply_page_image(&cx, pg(4), &[0x77; 512]).unwrap();
        assert_eq!(pager.dirty_count(), 0);
        assert_eq!(pager.page_count(), 4);
        let got = pager.get_page(&cx, pg(4)).unwrap();
        assert!(got.as_bytes().iter().all(|&b| b == 0x77));
    }

    #[test]
    fn truncate_drops_pages_beyond() {
        let vfs = MemoryVfs::new();
        let pager = mem_pager(&vfs, "/t.db");
        let cx = Cx::new();

        for n in 1..=4u32 {
            pager.write_page(&cx, pg(n), &[n as u8; 512]).unwrap();
        }
        pager.flush_dirty(&cx).unwrap();
        pager.write_page(&cx, pg(4), &[0xFF; 512]).unwrap();

        pager.truncate(&cx, 2).unwrap();
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.dirty_count(), 0);
    }

    #[test]
    fn close_flushes_remaining_dirty() {
        let vfs = MemoryVfs::new();
        let cx = Cx::new();
        {
            let pager = mem_pager(&vfs, "/c.db");
            pager.write_page(&cx, pg(1), &[0x5A; 512]).unwrap();
            pager.close(&cx).unwrap();
        }
        let pager = mem_pager(&vfs, "/c.db");
        let got = pager.get_page(&cx, pg(1)).unwrap();
        assert!(got.as_bytes().iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn cancelled_cx_surfaces() {
        let vfs = MemoryVfs::new();
        let pager = mem_pager(&vfs, "/x.db");
        let cx = Cx::new();
        cx.cancel();
        assert!(matches!(
            pager.get_page(&cx, pg(1)).unwrap_err(),
            StrataError::Cancelled
        ));
    }
}
