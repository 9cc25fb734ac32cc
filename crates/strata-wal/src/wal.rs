//! The WAL file: append, scan, rollback truncation, reset.
//!
//! Opening an existing WAL accepts the longest prefix of frames whose
//! salts match the header and whose running checksum validates, *ending at
//! the last commit frame*. Frames past that boundary — an uncommitted tail
//! or torn append — are invisible and get overwritten by the next writer.
//! Checksum verification is the sole arbiter of what survived a crash.

use strata_error::{Result, StrataError};
use strata_types::cx::Cx;
use strata_types::flags::SyncFlags;
use strata_types::PageData;
use strata_vfs::VfsFile;
use tracing::debug;

use crate::checksum::{
    frame_checksum, WalChecksum, WalFrameHeader, WalHeader, WalSalts, WAL_FORMAT_VERSION,
    WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WAL_MAGIC_LE,
};

/// Metadata for one accepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Page the frame carries.
    pub page_number: u32,
    /// Commit mark (db size in pages) or 0.
    pub commit_mark: u32,
    /// Cumulative checksum through this frame; seeds the next append and
    /// lets rollback rewind without rescanning.
    pub checksum: WalChecksum,
}

/// A WAL file and its accepted-frame state.
pub struct WalFile {
    file: Box<dyn VfsFile>,
    header: WalHeader,
    page_size: usize,
    /// Accepted frames, in file order. `frames.len()` is the valid frame
    /// count; everything beyond it on disk is dead bytes.
    frames: Vec<FrameInfo>,
    /// Checksum seed for the next append.
    running: WalChecksum,
}

impl WalFile {
    /// Create a fresh WAL: write the header, drop any stale body.
    pub fn create(
        cx: &Cx,
        mut file: Box<dyn VfsFile>,
        page_size: u32,
        checkpoint_seq: u32,
        salts: WalSalts,
    ) -> Result<Self> {
        let header = WalHeader {
            magic: WAL_MAGIC_LE,
            format_version: WAL_FORMAT_VERSION,
            page_size,
            checkpoint_seq,
            salts,
            checksum: WalChecksum::default(),
        };
        let bytes = header.to_bytes()?;
        file.write(cx, &bytes, 0)?;
        file.truncate(cx, WAL_HEADER_SIZE as u64)?;
        let running = WalHeader::parse(&bytes)?.checksum;
        debug!(page_size, checkpoint_seq, "WAL created");
        Ok(Self {
            file,
            header,
            page_size: page_size as usize,
            frames: Vec::new(),
            running,
        })
    }

    /// Open an existing WAL, scanning for the accepted frame prefix.
    pub fn open(cx: &Cx, mut file: Box<dyn VfsFile>) -> Result<Self> {
        let (header, frames, running) = Self::scan(cx, file.as_mut())?;
        debug!(frames = frames.len(), "WAL opened");
        Ok(Self {
            file,
            page_size: header.page_size as usize,
            header,
            frames,
            running,
        })
    }

    /// Validate the header and scan the longest commit-terminated frame
    /// prefix whose salts and running checksum hold.
    fn scan(
        cx: &Cx,
        file: &mut dyn VfsFile,
    ) -> Result<(WalHeader, Vec<FrameInfo>, WalChecksum)> {
        let mut header_buf = [0u8; WAL_HEADER_SIZE];
        let n = file.read(cx, &mut header_buf, 0)?;
        if n < WAL_HEADER_SIZE {
            return Err(StrataError::WalCorrupt {
                detail: format!("WAL too small for header: {n} bytes"),
            });
        }
        let header = WalHeader::parse(&header_buf)?;
        let seed = header.verify_checksum(&header_buf)?;
        let page_size = header.page_size as usize;
        let big_endian = header.big_endian();
        let frame_size = WAL_FRAME_HEADER_SIZE + page_size;

        let file_size = file.file_size(cx)?;
        let max_frames = usize::try_from(
            file_size.saturating_sub(WAL_HEADER_SIZE as u64) / frame_size as u64,
        )
        .unwrap_or(usize::MAX);

        let mut scanned: Vec<FrameInfo> = Vec::new();
        let mut running = seed;
        let mut commit_boundary = 0usize;
        let mut frame_buf = vec![0u8; frame_size];

        for index in 0..max_frames {
            cx.checkpoint()?;
            let offset = WAL_HEADER_SIZE as u64 + (index as u64) * frame_size as u64;
            let read = file.read(cx, &mut frame_buf, offset)?;
            if read < frame_size {
                debug!(frame = index, reason = "truncated_tail", "WAL scan stop");
                break;
            }
            let fh = WalFrameHeader::parse(&frame_buf[..WAL_FRAME_HEADER_SIZE])?;
            if fh.salts != header.salts {
                debug!(frame = index, reason = "salt_mismatch", "WAL scan stop");
                break;
            }
            let expected = frame_checksum(&frame_buf, page_size, running, big_endian)?;
            if fh.checksum != expected {
                debug!(frame = index, reason = "checksum_mismatch", "WAL scan stop");
                break;
            }
            running = expected;
            scanned.push(FrameInfo {
                page_number: fh.page_number,
                commit_mark: fh.commit_mark,
                checksum: expected,
            });
            if fh.is_commit() {
                commit_boundary = scanned.len();
                debug!(frame = index, db_size = fh.commit_mark, "WAL frame accepted (commit)");
            } else {
                debug!(frame = index, page = fh.page_number, "WAL frame accepted");
            }
        }

        // Only commit-terminated prefixes survive.
        scanned.truncate(commit_boundary);
        let running = scanned.last().map_or(seed, |f| f.checksum);
        Ok((header, scanned, running))
    }

    /// Number of valid (committed) frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Accepted frame metadata in file order.
    #[must_use]
    pub fn frames(&self) -> &[FrameInfo] {
        &self.frames
    }

    /// Database size in pages as of the most recent commit frame, if any.
    #[must_use]
    pub fn committed_db_size(&self) -> Option<u32> {
        self.frames.iter().rev().find_map(|f| {
            (f.commit_mark > 0).then_some(f.commit_mark)
        })
    }

    /// The WAL header.
    #[must_use]
    pub fn header(&self) -> &WalHeader {
        &self.header
    }

    /// Page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn frame_size(&self) -> usize {
        WAL_FRAME_HEADER_SIZE + self.page_size
    }

    fn frame_offset(&self, index: usize) -> u64 {
        WAL_HEADER_SIZE as u64 + (index as u64) * self.frame_size() as u64
    }

    /// Append one transaction's pages as consecutive frames; the final
    /// frame carries `commit_db_size` as its commit mark.
    ///
    /// Returns the index of the first appended frame. On success the
    /// frames are in the file but durable only after [`Self::sync`].
    pub fn append_commit(
        &mut self,
        cx: &Cx,
        pages: &[(u32, &PageData)],
        commit_db_size: u32,
    ) -> Result<usize> {
        if pages.is_empty() {
            return Err(StrataError::internal("empty WAL commit batch"));
        }
        let first_index = self.frames.len();
        let big_endian = self.header.big_endian();
        let mut running = self.running;
        let mut frame_buf = vec![0u8; self.frame_size()];

        for (i, (page_number, data)) in pages.iter().enumerate() {
            cx.checkpoint()?;
            debug_assert_eq!(data.len(), self.page_size);
            let is_last = i + 1 == pages.len();
            let mut fh = WalFrameHeader {
                page_number: *page_number,
                commit_mark: if is_last { commit_db_size } else { 0 },
                salts: self.header.salts,
                checksum: WalChecksum::default(),
            };

            frame_buf[..WAL_FRAME_HEADER_SIZE].copy_from_slice(&fh.to_bytes());
            frame_buf[WAL_FRAME_HEADER_SIZE..].copy_from_slice(data.as_bytes());
            let checksum = frame_checksum(&frame_buf, self.page_size, running, big_endian)?;
            fh.checksum = checksum;
            frame_buf[..WAL_FRAME_HEADER_SIZE].copy_from_slice(&fh.to_bytes());

            let index = first_index + i;
            self.file.write(cx, &frame_buf, self.frame_offset(index))?;
            running = checksum;
            self.frames.push(FrameInfo {
                page_number: *page_number,
                commit_mark: fh.commit_mark,
                checksum,
            });
        }

        self.running = running;
        Ok(first_index)
    }

    /// Durably flush appended frames.
    pub fn sync(&mut self, cx: &Cx) -> Result<()> {
        self.file.sync(cx, SyncFlags::FULL)
    }

    /// Read the page image carried by frame `index`.
    pub fn read_frame_page(&mut self, cx: &Cx, index: usize) -> Result<PageData> {
        if index >= self.frames.len() {
            return Err(StrataError::internal(format!(
                "frame index {index} out of range ({})",
                self.frames.len()
            )));
        }
        let mut buf = vec![0u8; self.page_size];
        let offset = self.frame_offset(index) + WAL_FRAME_HEADER_SIZE as u64;
        let n = self.file.read(cx, &mut buf, offset)?;
        if n < self.page_size {
            return Err(StrataError::ShortRead {
                expected: self.page_size,
                actual: n,
            });
        }
        Ok(PageData::from_vec(buf))
    }

    /// Re-synchronize with the on-disk WAL if another handle appended,
    /// truncated, or reset it. Returns `true` when anything changed.
    ///
    /// The WAL file is the cross-process source of truth; this handle's
    /// frame list is just a cache of the last scan. A full rescan keeps
    /// the logic identical to the open path, including detection of a
    /// reset-then-regrown file (the fresh salts terminate the old chain).
    pub fn refresh(&mut self, cx: &Cx) -> Result<bool> {
        let expected_size =
            WAL_HEADER_SIZE as u64 + (self.frames.len() as u64) * self.frame_size() as u64;
        let file_size = self.file.file_size(cx)?;

        if file_size == expected_size {
            // Same length can still hide a reset that regrew to the exact
            // size; the salts expose it.
            let mut header_buf = [0u8; WAL_HEADER_SIZE];
            let n = self.file.read(cx, &mut header_buf, 0)?;
            if n == WAL_HEADER_SIZE {
                if let Ok(disk) = WalHeader::parse(&header_buf) {
                    if disk.salts == self.header.salts
                        && disk.checkpoint_seq == self.header.checkpoint_seq
                    {
                        return Ok(false);
                    }
                }
            }
        }

        let (header, frames, running) = Self::scan(cx, self.file.as_mut())?;
        self.page_size = header.page_size as usize;
        self.header = header;
        self.frames = frames;
        self.running = running;
        debug!(frames = self.frames.len(), "WAL refreshed from disk");
        Ok(true)
    }

    /// Rewind to `frame_count` frames, truncating the file. Used by
    /// rollback (back to the begin-time watermark) and by commit-failure
    /// cleanup.
    pub fn truncate_to(&mut self, cx: &Cx, frame_count: usize) -> Result<()> {
        if frame_count > self.frames.len() {
            return Err(StrataError::internal(format!(
                "cannot truncate to {frame_count}: only {} frames",
                self.frames.len()
            )));
        }
        self.frames.truncate(frame_count);
        self.running = self
            .frames
            .last()
            .map_or(self.header.checksum, |f| f.checksum);
        let end = self.frame_offset(frame_count);
        self.file.truncate(cx, end)?;
        debug!(frames = frame_count, "WAL truncated");
        Ok(())
    }

    /// Reset after a checkpoint: truncate to zero frames and rewrite the
    /// header with a bumped checkpoint sequence and **fresh salts**, so no
    /// frame of the prior generation can ever validate again.
    pub fn reset(&mut self, cx: &Cx, salts: WalSalts) -> Result<()> {
        let header = WalHeader {
            magic: self.header.magic,
            format_version: WAL_FORMAT_VERSION,
            page_size: self.header.page_size,
            checkpoint_seq: self.header.checkpoint_seq.wrapping_add(1),
            salts,
            checksum: WalChecksum::default(),
        };
        let bytes = header.to_bytes()?;
        self.file.write(cx, &bytes, 0)?;
        self.file.truncate(cx, WAL_HEADER_SIZE as u64)?;
        self.file.sync(cx, SyncFlags::FULL)?;

        self.header = WalHeader::parse(&bytes)?;
        self.running = self.header.checksum;
        self.frames.clear();
        debug!(checkpoint_seq = self.header.checkpoint_seq, "WAL reset");
        Ok(())
    }

    /// Close the underlying file handle.
    pub fn close(&mut self, cx: &Cx) -> Result<()> {
        self.file.close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use strata_types::flags::VfsOpenFlags;
    use strata_types::PageSize;
    use strata_vfs::{MemoryVfs, Vfs};

    const PS: u32 = 512;

    fn open_wal_file(vfs: &MemoryVfs, name: &str) -> Box<dyn VfsFile> {
        let cx = Cx::new();
        vfs.open(
            &cx,
            Path::new(name),
            VfsOpenFlags::WAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE,
        )
        .unwrap()
    }

    fn page(byte: u8) -> PageData {
        let mut p = PageData::zeroed(PageSize::new(PS).unwrap());
        p.as_bytes_mut().fill(byte);
        p
    }

    fn salts() -> WalSalts {
        WalSalts {
            salt1: 0x1111_2222,
            salt2: 0x3333_4444,
        }
    }

    #[test]
    fn create_append_reopen() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        {
            let file = open_wal_file(&vfs, "/w");
            let mut wal = WalFile::create(&cx, file, PS, 0, salts()).unwrap();
            let p2 = page(0x42);
            let p3 = page(0x43);
            wal.append_commit(&cx, &[(2, &p2), (3, &p3)], 3).unwrap();
            wal.sync(&cx).unwrap();
        }

        let mut wal = WalFile::open(&cx, open_wal_file(&vfs, "/w")).unwrap();
        assert_eq!(wal.frame_count(), 2);
        assert_eq!(wal.committed_db_size(), Some(3));
        assert_eq!(wal.frames()[0].page_number, 2);
        assert_eq!(wal.frames()[1].commit_mark, 3);
        let img = wal.read_frame_page(&cx, 0).unwrap();
        assert!(img.as_bytes().iter().all(|&b| b == 0x42));
    }

    #[test]
    fn uncommitted_tail_is_dropped_on_open() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        {
            let file = open_wal_file(&vfs, "/w2");
            let mut wal = WalFile::create(&cx, file, PS, 0, salts()).unwrap();
            let p2 = page(1);
            wal.append_commit(&cx, &[(2, &p2)], 2).unwrap();
            wal.sync(&cx).unwrap();

            // Simulate a crash mid-commit: frames appended with NO commit
            // frame at the end (commit_db_size only marks the last frame,
            // so cut the file right before it).
            let p4 = page(4);
            let p5 = page(5);
            wal.append_commit(&cx, &[(4, &p4), (5, &p5)], 5).unwrap();
        }
        // Chop the final (commit) frame in half: torn write.
        {
            let cx = Cx::new();
            let mut f = open_wal_file(&vfs, "/w2");
            let size = f.file_size(&cx).unwrap();
            f.truncate(&cx, size - 300).unwrap();
        }

        let wal = WalFile::open(&cx, open_wal_file(&vfs, "/w2")).unwrap();
        // Frame for page 4 validates but has no commit terminator after the
        // torn tail, so only the first transaction survives.
        assert_eq!(wal.frame_count(), 1);
        assert_eq!(wal.committed_db_size(), Some(2));
    }

    #[test]
    fn corrupt_byte_truncates_accepted_prefix() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        {
            let file = open_wal_file(&vfs, "/w3");
            let mut wal = WalFile::create(&cx, file, PS, 0, salts()).unwrap();
            for n in 2..=4u32 {
                let p = page(n as u8);
                wal.append_commit(&cx, &[(n, &p)], n).unwrap();
            }
            wal.sync(&cx).unwrap();
        }

        // Corrupt one byte in the second frame's image.
        {
            let mut f = open_wal_file(&vfs, "/w3");
            let offset = WAL_HEADER_SIZE as u64
                + (WAL_FRAME_HEADER_SIZE + PS as usize) as u64
                + WAL_FRAME_HEADER_SIZE as u64
                + 17;
            f.write(&cx, &[0xFF], offset).unwrap();
        }

        let wal = WalFile::open(&cx, open_wal_file(&vfs, "/w3")).unwrap();
        assert_eq!(wal.frame_count(), 1);
        assert_eq!(wal.committed_db_size(), Some(2));
    }

    #[test]
    fn salt_mismatch_terminates_chain() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        {
            let file = open_wal_file(&vfs, "/w4");
            let mut wal = WalFile::create(&cx, file, PS, 0, salts()).unwrap();
            let p = page(9);
            wal.append_commit(&cx, &[(2, &p)], 2).unwrap();
            wal.sync(&cx).unwrap();
        }
        // Rewrite the frame's salt_1 to a foreign generation.
        {
            let mut f = open_wal_file(&vfs, "/w4");
            f.write(
                &cx,
                &0xDEAD_0000u32.to_be_bytes(),
                WAL_HEADER_SIZE as u64 + 8,
            )
            .unwrap();
        }
        let wal = WalFile::open(&cx, open_wal_file(&vfs, "/w4")).unwrap();
        assert_eq!(wal.frame_count(), 0);
    }

    #[test]
    fn truncate_to_rewinds_running_checksum() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let file = open_wal_file(&vfs, "/w5");
        let mut wal = WalFile::create(&cx, file, PS, 0, salts()).unwrap();

        let p2 = page(2);
        wal.append_commit(&cx, &[(2, &p2)], 2).unwrap();
        let watermark = wal.frame_count();
        let p3 = page(3);
        wal.append_commit(&cx, &[(3, &p3)], 3).unwrap();

        wal.truncate_to(&cx, watermark).unwrap();
        assert_eq!(wal.frame_count(), 1);

        // Appending after the rewind must produce a chain that re-validates.
        let p4 = page(4);
        wal.append_commit(&cx, &[(4, &p4)], 4).unwrap();
        wal.sync(&cx).unwrap();

        let wal2 = WalFile::open(&cx, open_wal_file(&vfs, "/w5")).unwrap();
        assert_eq!(wal2.frame_count(), 2);
        assert_eq!(wal2.committed_db_size(), Some(4));
    }

    #[test]
    fn reset_regenerates_generation() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let file = open_wal_file(&vfs, "/w6");
        let mut wal = WalFile::create(&cx, file, PS, 0, salts()).unwrap();
        let p = page(1);
        wal.append_commit(&cx, &[(2, &p)], 2).unwrap();
        wal.sync(&cx).unwrap();

        let new_salts = WalSalts {
            salt1: 0x5555_6666,
            salt2: 0x7777_8888,
        };
        wal.reset(&cx, new_salts).unwrap();
        assert_eq!(wal.frame_count(), 0);
        assert_eq!(wal.header().checkpoint_seq, 1);
        assert_eq!(wal.header().salts, new_salts);

        let wal2 = WalFile::open(&cx, open_wal_file(&vfs, "/w6")).unwrap();
        assert_eq!(wal2.frame_count(), 0);
        assert_eq!(wal2.header().checkpoint_seq, 1);
    }

    #[test]
    fn stale_tail_after_boundary_is_overwritten() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let file = open_wal_file(&vfs, "/w7");
        let mut wal = WalFile::create(&cx, file, PS, 0, salts()).unwrap();

        let p2 = page(2);
        wal.append_commit(&cx, &[(2, &p2)], 2).unwrap();
        let watermark = wal.frame_count();
        let p3 = page(3);
        wal.append_commit(&cx, &[(3, &p3)], 3).unwrap();
        wal.truncate_to(&cx, watermark).unwrap();

        let p9 = page(9);
        wal.append_commit(&cx, &[(9, &p9)], 9).unwrap();
        wal.sync(&cx).unwrap();

        let mut wal2 = WalFile::open(&cx, open_wal_file(&vfs, "/w7")).unwrap();
        assert_eq!(wal2.frame_count(), 2);
        assert_eq!(wal2.frames()[1].page_number, 9);
        let img = wal2.read_frame_page(&cx, 1).unwrap();
        assert!(img.as_bytes().iter().all(|&b| b == 9));
    }
}
