//! The 100-byte database file header on page 1.
//!
//! All multi-byte fields are big-endian at fixed offsets:
//!
//! ```text
//! Offset  Size  Field
//!   0      16   magic: "SQLite format 3\0"
//!  16       2   page_size (value 1 means 65536)
//!  18       1   write_format (1 = journal, 2 = WAL)
//!  19       1   read_format  (1 = journal, 2 = WAL)
//!  20       1   reserved bytes per page
//!  21       3   payload fractions (64, 32, 32)
//!  24       4   file_change_counter
//!  28       4   db_size_in_pages
//!  32       4   first_freelist_trunk
//!  36       4   freelist_page_count
//!  40       4   schema_cookie
//!  44       4   schema_format
//!  48       4   default_cache_size
//!  52       4   largest_root_btree
//!  56       4   text_encoding (1=utf8, 2=utf16le, 3=utf16be)
//!  60       4   user_version
//!  64       4   incremental_vacuum
//!  68       4   application_id
//!  72      20   reserved (must be zero)
//!  92       4   version_valid_for
//!  96       4   library_version
//! ```

use strata_error::{Result, StrataError};

use crate::limits::DATABASE_HEADER_SIZE;
use crate::PageSize;

/// The 16-byte header magic.
pub const HEADER_MAGIC: [u8; 16] = *b"SQLite format 3\0";

/// Library version number stamped at offset 96 of new databases.
pub const LIBRARY_VERSION_NUMBER: u32 = 3_046_000;

/// File format version for rollback-journal databases.
pub const FORMAT_JOURNAL: u8 = 1;
/// File format version for WAL databases.
pub const FORMAT_WAL: u8 = 2;

/// Database text encoding stored at offset 56.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TextEncoding {
    /// UTF-8.
    #[default]
    Utf8 = 1,
    /// UTF-16 little-endian.
    Utf16Le = 2,
    /// UTF-16 big-endian.
    Utf16Be = 3,
}

impl TextEncoding {
    fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(Self::Utf8),
            2 => Ok(Self::Utf16Le),
            3 => Ok(Self::Utf16Be),
            other => Err(StrataError::invalid_format(format!(
                "invalid text encoding: {other}"
            ))),
        }
    }
}

/// Parsed content of the first 100 bytes of page 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    /// Page size in bytes.
    pub page_size: PageSize,
    /// File format write version (1 = journal, 2 = WAL).
    pub write_format: u8,
    /// File format read version (1 = journal, 2 = WAL).
    pub read_format: u8,
    /// Bytes reserved at the end of every page.
    pub reserved_per_page: u8,
    /// Monotonic counter, bumped on every successful write transaction
    /// that modifies page 1.
    pub file_change_counter: u32,
    /// Logical database size in pages.
    pub db_size_in_pages: u32,
    /// Page number of the first freelist trunk page (0 if none).
    pub first_freelist_trunk: u32,
    /// Total number of freelist pages.
    pub freelist_page_count: u32,
    /// Schema cookie.
    pub schema_cookie: u32,
    /// Schema format number.
    pub schema_format: u32,
    /// Default page cache size hint.
    pub default_cache_size: u32,
    /// Largest b-tree root page (vacuum bookkeeping).
    pub largest_root_btree: u32,
    /// Database text encoding.
    pub text_encoding: TextEncoding,
    /// User version.
    pub user_version: u32,
    /// Non-zero for incremental vacuum.
    pub incremental_vacuum: u32,
    /// Application ID.
    pub application_id: u32,
    /// Change-counter value at which `library_version` was stamped.
    pub version_valid_for: u32,
    /// Version number of the library that last wrote the file.
    pub library_version: u32,
}

impl DatabaseHeader {
    /// Header for a freshly created database of the given page size.
    #[must_use]
    pub fn new(page_size: PageSize, wal: bool) -> Self {
        let format = if wal { FORMAT_WAL } else { FORMAT_JOURNAL };
        Self {
            page_size,
            write_format: format,
            read_format: format,
            reserved_per_page: 0,
            file_change_counter: 0,
            db_size_in_pages: 1,
            first_freelist_trunk: 0,
            freelist_page_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            default_cache_size: 0,
            largest_root_btree: 0,
            text_encoding: TextEncoding::Utf8,
            user_version: 0,
            incremental_vacuum: 0,
            application_id: 0,
            version_valid_for: 0,
            library_version: LIBRARY_VERSION_NUMBER,
        }
    }

    /// Parse and validate a header from the start of page 1.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < DATABASE_HEADER_SIZE {
            return Err(StrataError::invalid_format(format!(
                "header requires {DATABASE_HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        if buf[0..16] != HEADER_MAGIC {
            return Err(StrataError::invalid_format("bad header magic"));
        }

        let raw_page_size = u16::from_be_bytes([buf[16], buf[17]]);
        let page_size = PageSize::from_header_field(raw_page_size).ok_or_else(|| {
            StrataError::invalid_format(format!("invalid page size field: {raw_page_size}"))
        })?;

        let write_format = buf[18];
        let read_format = buf[19];
        if !matches!(write_format, FORMAT_JOURNAL | FORMAT_WAL)
            || !matches!(read_format, FORMAT_JOURNAL | FORMAT_WAL)
        {
            return Err(StrataError::invalid_format(format!(
                "invalid file format versions: write={write_format} read={read_format}"
            )));
        }

        if buf[21] != 64 || buf[22] != 32 || buf[23] != 32 {
            return Err(StrataError::invalid_format(
                "invalid payload fraction constants",
            ));
        }

        if buf[72..92].iter().any(|&b| b != 0) {
            return Err(StrataError::invalid_format(
                "reserved header region is not zeroed",
            ));
        }

        Ok(Self {
            page_size,
            write_format,
            read_format,
            reserved_per_page: buf[20],
            file_change_counter: read_be_u32(buf, 24),
            db_size_in_pages: read_be_u32(buf, 28),
            first_freelist_trunk: read_be_u32(buf, 32),
            freelist_page_count: read_be_u32(buf, 36),
            schema_cookie: read_be_u32(buf, 40),
            schema_format: read_be_u32(buf, 44),
            default_cache_size: read_be_u32(buf, 48),
            largest_root_btree: read_be_u32(buf, 52),
            text_encoding: TextEncoding::from_raw(read_be_u32(buf, 56))?,
            user_version: read_be_u32(buf, 60),
            incremental_vacuum: read_be_u32(buf, 64),
            application_id: read_be_u32(buf, 68),
            version_valid_for: read_be_u32(buf, 92),
            library_version: read_be_u32(buf, 96),
        })
    }

    /// Serialize into the 100-byte on-disk layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DATABASE_HEADER_SIZE] {
        let mut buf = [0u8; DATABASE_HEADER_SIZE];
        buf[0..16].copy_from_slice(&HEADER_MAGIC);
        buf[16..18].copy_from_slice(&self.page_size.to_header_field().to_be_bytes());
        buf[18] = self.write_format;
        buf[19] = self.read_format;
        buf[20] = self.reserved_per_page;
        buf[21] = 64;
        buf[22] = 32;
        buf[23] = 32;
        write_be_u32(&mut buf, 24, self.file_change_counter);
        write_be_u32(&mut buf, 28, self.db_size_in_pages);
        write_be_u32(&mut buf, 32, self.first_freelist_trunk);
        write_be_u32(&mut buf, 36, self.freelist_page_count);
        write_be_u32(&mut buf, 40, self.schema_cookie);
        write_be_u32(&mut buf, 44, self.schema_format);
        write_be_u32(&mut buf, 48, self.default_cache_size);
        write_be_u32(&mut buf, 52, self.largest_root_btree);
        write_be_u32(&mut buf, 56, self.text_encoding as u32);
        write_be_u32(&mut buf, 60, self.user_version);
        write_be_u32(&mut buf, 64, self.incremental_vacuum);
        write_be_u32(&mut buf, 68, self.application_id);
        // bytes 72..92 stay zero
        write_be_u32(&mut buf, 92, self.version_valid_for);
        write_be_u32(&mut buf, 96, self.library_version);
        buf
    }

    /// Record a successful write transaction: bump the change counter and
    /// the logical page count, keeping `version_valid_for` in step.
    pub fn record_commit(&mut self, db_size_in_pages: u32) {
        self.file_change_counter = self.file_change_counter.wrapping_add(1);
        self.db_size_in_pages = db_size_in_pages;
        self.version_valid_for = self.file_change_counter;
        self.library_version = LIBRARY_VERSION_NUMBER;
    }
}

#[inline]
fn read_be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

#[inline]
fn write_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}
