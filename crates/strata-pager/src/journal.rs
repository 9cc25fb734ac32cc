//! Rollback journal: pre-images of modified pages, written before the main
//! file is touched so an in-flight transaction can always be undone.
//!
//! On-disk layout:
//!
//! ```text
//! [Header, padded to sector size]
//!   0   8  magic: d9 d5 05 f9 20 a1 63 d7
//!   8   4  record_count (big-endian)
//!  12   4  checksum nonce
//!  16   4  initial_db_size (pages)
//!  20   4  sector_size
//!  24   4  page_size
//! [Record 0] page_number (4) | page image (page_size) | checksum (4)
//! [Record 1] ...
//! ```
//!
//! A journal is **hot** when its header is fully synced with a non-zero
//! record count: that marks a transaction that never finished, and recovery
//! must replay the pre-images. A zeroed or absent header means there is
//! nothing to undo.

use strata_error::{Result, StrataError};
use strata_types::cx::Cx;
use strata_types::flags::SyncFlags;
use strata_types::{JournalMode, PageSize};
use strata_vfs::VfsFile;
use tracing::debug;

/// The 8-byte journal magic.
pub const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];

/// Unpadded size of the journal header fields.
pub const JOURNAL_HEADER_SIZE: usize = 28;

/// Journal file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// Number of pre-image records that follow.
    pub record_count: u32,
    /// Seed for the per-record checksums.
    pub nonce: u32,
    /// Database size in pages when the transaction began; rollback
    /// truncates back to this.
    pub initial_db_size: u32,
    /// Sector size the header is padded to.
    pub sector_size: u32,
    /// Database page size.
    pub page_size: u32,
}

impl JournalHeader {
    /// Serialize, padded with zeros to `sector_size`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let padded = (self.sector_size as usize).max(JOURNAL_HEADER_SIZE);
        let mut buf = vec![0u8; padded];
        buf[0..8].copy_from_slice(&JOURNAL_MAGIC);
        buf[8..12].copy_from_slice(&self.record_count.to_be_bytes());
        buf[12..16].copy_from_slice(&self.nonce.to_be_bytes());
        buf[16..20].copy_from_slice(&self.initial_db_size.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sector_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.page_size.to_be_bytes());
        buf
    }

    /// Parse a header. Returns `Ok(None)` when the magic is absent or
    /// zeroed (a cold journal left behind by `journal_mode=PERSIST`).
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < JOURNAL_HEADER_SIZE {
            return Ok(None);
        }
        if buf[0..8] != JOURNAL_MAGIC {
            return Ok(None);
        }
        let header = Self {
            record_count: read_be_u32(buf, 8),
            nonce: read_be_u32(buf, 12),
            initial_db_size: read_be_u32(buf, 16),
            sector_size: read_be_u32(buf, 20),
            page_size: read_be_u32(buf, 24),
        };
        if PageSize::new(header.page_size).is_none() {
            return Err(StrataError::JournalCorrupt {
                detail: format!("invalid page size in journal header: {}", header.page_size),
            });
        }
        if header.sector_size == 0 {
            return Err(StrataError::JournalCorrupt {
                detail: "zero sector size in journal header".to_owned(),
            });
        }
        Ok(Some(header))
    }
}

/// Checksum over one pre-image, seeded with the journal nonce.
#[must_use]
pub fn record_checksum(nonce: u32, page_image: &[u8]) -> u32 {
    page_image
        .iter()
        .fold(nonce, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// One parsed pre-image record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    /// Page the pre-image belongs to.
    pub page_number: u32,
    /// Original page bytes.
    pub image: Vec<u8>,
}

/// An open rollback journal being written by the active transaction.
pub struct JournalFile {
    file: Box<dyn VfsFile>,
    header: JournalHeader,
    /// Byte offset where the next record lands.
    write_offset: u64,
    /// Whether the header on disk reflects `header.record_count`.
    header_clean: bool,
}

impl JournalFile {
    /// Create a fresh journal on an opened (empty) file.
    pub fn create(
        cx: &Cx,
        mut file: Box<dyn VfsFile>,
        nonce: u32,
        initial_db_size: u32,
        page_size: PageSize,
    ) -> Result<Self> {
        let sector_size = file.sector_size().max(JOURNAL_HEADER_SIZE as u32);
        let header = JournalHeader {
            record_count: 0,
            nonce,
            initial_db_size,
            sector_size,
            page_size: page_size.get(),
        };
        let bytes = header.to_bytes();
        file.write(cx, &bytes, 0)?;
        file.truncate(cx, bytes.len() as u64)?;
        Ok(Self {
            file,
            header,
            write_offset: bytes.len() as u64,
            header_clean: true,
        })
    }

    /// The journal header as currently tracked in memory.
    #[must_use]
    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    /// Append one pre-image record. The header on disk is left stale (its
    /// record count still excludes this record) until [`Self::sync`] runs;
    /// a crash before that sync leaves the journal cold, which is correct
    /// because the main file has not been modified yet either.
    pub fn append_preimage(&mut self, cx: &Cx, page_number: u32, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len(), self.header.page_size as usize);
        let checksum = record_checksum(self.header.nonce, image);

        let mut record = Vec::with_capacity(8 + image.len());
        record.extend_from_slice(&page_number.to_be_bytes());
        record.extend_from_slice(image);
        record.extend_from_slice(&checksum.to_be_bytes());
        self.file.write(cx, &record, self.write_offset)?;

        self.write_offset += record.len() as u64;
        self.header.record_count += 1;
        self.header_clean = false;
        Ok(())
    }

    /// Make the journal hot: rewrite the header with the current record
    /// count and sync. After this returns, the pre-images are durable and
    /// the transaction may modify the main file.
    pub fn sync(&mut self, cx: &Cx) -> Result<()> {
        if !self.header_clean {
            self.file.write(cx, &self.header.to_bytes(), 0)?;
            self.header_clean = true;
        }
        self.file.sync(cx, SyncFlags::FULL)?;
        debug!(records = self.header.record_count, "journal synced");
        Ok(())
    }

    /// Number of pre-images appended so far.
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    /// Finalize at commit: the main file is durable, so the journal's
    /// pre-images are obsolete. `Delete` is handled by the caller (the
    /// journal cannot unlink itself); this handles the in-file modes.
    pub fn finalize(&mut self, cx: &Cx, mode: JournalMode) -> Result<()> {
        match mode {
            JournalMode::Truncate => {
                self.file.truncate(cx, 0)?;
                self.file.sync(cx, SyncFlags::FULL)?;
            }
            JournalMode::Persist => {
                // Zero the header sector; the stale body is unreachable.
                let zeros = vec![0u8; self.header.sector_size as usize];
                self.file.write(cx, &zeros, 0)?;
                self.file.sync(cx, SyncFlags::FULL)?;
            }
            _ => {}
        }
        self.header.record_count = 0;
        self.write_offset = u64::from(self.header.sector_size);
        self.header_clean = true;
        Ok(())
    }

    /// Close the underlying handle.
    pub fn close(&mut self, cx: &Cx) -> Result<()> {
        self.file.close(cx)
    }
}

/// Read every valid record from a journal file.
///
/// Records are returned in journal order (the order rollback must apply
/// them). A torn record at the tail — short read or checksum mismatch — is
/// where the scan stops; records before it are intact by construction
/// because the header sync ordered them.
pub fn read_records(cx: &Cx, file: &mut dyn VfsFile) -> Result<Option<(JournalHeader, Vec<JournalRecord>)>> {
    let mut probe = vec![0u8; JOURNAL_HEADER_SIZE];
    let n = file.read(cx, &mut probe, 0)?;
    if n < JOURNAL_HEADER_SIZE {
        return Ok(None);
    }
    let Some(header) = JournalHeader::parse(&probe)? else {
        return Ok(None);
    };

    let page_size = header.page_size as usize;
    let record_size = 8 + page_size;
    let mut records = Vec::with_capacity(header.record_count as usize);
    let mut offset = u64::from(header.sector_size.max(JOURNAL_HEADER_SIZE as u32));
    let mut buf = vec![0u8; record_size];

    for index in 0..header.record_count {
        cx.checkpoint()?;
        let n = file.read(cx, &mut buf, offset)?;
        if n < record_size {
            debug!(index, "journal record truncated; stopping replay scan");
            break;
        }
        let page_number = read_be_u32(&buf, 0);
        let image = buf[4..4 + page_size].to_vec();
        let stored = read_be_u32(&buf, 4 + page_size);
        if stored != record_checksum(header.nonce, &image) {
            debug!(index, page_number, "journal record checksum mismatch; stopping");
            break;
        }
        if page_number == 0 {
            debug!(index, "journal record names page 0; stopping");
            break;
        }
        records.push(JournalRecord { page_number, image });
        offset += record_size as u64;
    }

    Ok(Some((header, records)))
}

#[inline]
fn read_be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use strata_types::flags::VfsOpenFlags;
    use strata_vfs::{MemoryVfs, Vfs};

    const PS: PageSize = PageSize::MIN;

    fn open_journal_file(vfs: &MemoryVfs, name: &str) -> Box<dyn VfsFile> {
        let cx = Cx::new();
        vfs.open(
            &cx,
            Path::new(name),
            VfsOpenFlags::JOURNAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE,
        )
        .unwrap()
    }

    #[test]
    fn header_roundtrip() {
        let header = JournalHeader {
            record_count: 3,
            nonce: 0xDEAD_BEEF,
            initial_db_size: 12,
            sector_size: 512,
            page_size: 4096,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 512);
        assert_eq!(JournalHeader::parse(&bytes).unwrap(), Some(header));
    }

    #[test]
    fn zeroed_header_parses_as_cold() {
        assert_eq!(JournalHeader::parse(&[0u8; 512]).unwrap(), None);
    }

    #[test]
    fn bad_page_size_is_corrupt() {
        let mut bytes = JournalHeader {
            record_count: 1,
            nonce: 1,
            initial_db_size: 1,
            sector_size: 512,
            page_size: 4096,
        }
        .to_bytes();
        bytes[24..28].copy_from_slice(&777u32.to_be_bytes());
        assert!(matches!(
            JournalHeader::parse(&bytes).unwrap_err(),
            StrataError::JournalCorrupt { .. }
        ));
    }

    #[test]
    fn append_sync_read_back() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let file = open_journal_file(&vfs, "/j");
        let mut journal = JournalFile::create(&cx, file, 42, 2, PS).unwrap();

        journal.append_preimage(&cx, 2, &[0x11; 512]).unwrap();
        journal.append_preimage(&cx, 3, &[0x22; 512]).unwrap();
        journal.sync(&cx).unwrap();

        let mut reader = open_journal_file(&vfs, "/j");
        let (header, records) = read_records(&cx, reader.as_mut()).unwrap().unwrap();
        assert_eq!(header.record_count, 2);
        assert_eq!(header.initial_db_size, 2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].page_number, 2);
        assert!(records[0].image.iter().all(|&b| b == 0x11));
        assert_eq!(records[1].page_number, 3);
    }

    #[test]
    fn unsynced_header_reads_as_empty() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let file = open_journal_file(&vfs, "/j2");
        let mut journal = JournalFile::create(&cx, file, 7, 1, PS).unwrap();
        journal.append_preimage(&cx, 2, &[0xAB; 512]).unwrap();
        // no sync: header still says zero records

        let mut reader = open_journal_file(&vfs, "/j2");
        let (header, records) = read_records(&cx, reader.as_mut()).unwrap().unwrap();
        assert_eq!(header.record_count, 0);
        assert!(records.is_empty());
    }

    #[test]
    fn corrupt_record_stops_scan() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let file = open_journal_file(&vfs, "/j3");
        let mut journal = JournalFile::create(&cx, file, 9, 1, PS).unwrap();
        journal.append_preimage(&cx, 2, &[0x01; 512]).unwrap();
        journal.append_preimage(&cx, 3, &[0x02; 512]).unwrap();
        journal.sync(&cx).unwrap();

        // Flip a byte inside the second record's image.
        let mut vandal = open_journal_file(&vfs, "/j3");
        let second_record_offset = 512 + (8 + 512) as u64 + 20;
        vandal.write(&cx, &[0xFF], second_record_offset).unwrap();

        let mut reader = open_journal_file(&vfs, "/j3");
        let (_, records) = read_records(&cx, reader.as_mut()).unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].page_number, 2);
    }

    #[test]
    fn finalize_truncate_leaves_empty_file() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let file = open_journal_file(&vfs, "/j4");
        let mut journal = JournalFile::create(&cx, file, 1, 1, PS).unwrap();
        journal.append_preimage(&cx, 2, &[0u8; 512]).unwrap();
        journal.sync(&cx).unwrap();
        journal.finalize(&cx, JournalMode::Truncate).unwrap();

        let mut reader = open_journal_file(&vfs, "/j4");
        assert_eq!(reader.file_size(&cx).unwrap(), 0);
        assert!(read_records(&cx, reader.as_mut()).unwrap().is_none());
    }

    #[test]
    fn finalize_persist_zeroes_header() {
        let cx = Cx::new();
        let vfs = MemoryVfs::new();
        let file = open_journal_file(&vfs, "/j5");
        let mut journal = JournalFile::create(&cx, file, 1, 1, PS).unwrap();
        journal.append_preimage(&cx, 2, &[0u8; 512]).unwrap();
        journal.sync(&cx).unwrap();
        journal.finalize(&cx, JournalMode::Persist).unwrap();

        let mut reader = open_journal_file(&vfs, "/j5");
        assert!(reader.file_size(&cx).unwrap() > 0);
        assert!(read_records(&cx, reader.as_mut()).unwrap().is_none());
    }

    #[test]
    fn record_checksum_is_nonce_seeded() {
        let image = [1u8, 2, 3];
        assert_eq!(record_checksum(0, &image), 6);
        assert_eq!(record_checksum(10, &image), 16);
        assert_ne!(record_checksum(1, &image), record_checksum(2, &image));
    }
}
