//! WAL on-disk structures and the running checksum chain.
//!
//! The WAL file is a 32-byte header followed by frames, each a 24-byte
//! header plus one page image:
//!
//! ```text
//! WAL header                      Frame header
//!  0  4  magic (0x377F0682/83)     0  4  page_number
//!  4  4  format version (3007000)  4  4  commit mark: db size in pages
//!  8  4  page_size                          on commit frames, else 0
//! 12  4  checkpoint_seq            8  4  salt_1 (copied from header)
//! 16  4  salt_1                   12  4  salt_2
//! 20  4  salt_2                   16  4  cumulative checksum_1
//! 24  4  checksum_1               20  4  cumulative checksum_2
//! 28  4  checksum_2
//! ```
//!
//! The checksum is the Fletcher-like pair used by the deployed format:
//! input is consumed as aligned u32 word pairs with
//! `s1 += w0 + s2; s2 += w1 + s1` (wrapping). The header checksum covers
//! header bytes 0..24; each frame's checksum chains from the previous
//! frame (or the header seed) over the frame header's first 8 bytes and
//! the page image. The low bit of the magic selects the word byte order.

use strata_error::{Result, StrataError};

/// WAL header size in bytes.
pub const WAL_HEADER_SIZE: usize = 32;
/// WAL frame header size in bytes.
pub const WAL_FRAME_HEADER_SIZE: usize = 24;
/// Magic for little-endian checksum words.
pub const WAL_MAGIC_LE: u32 = 0x377F_0682;
/// Magic for big-endian checksum words.
pub const WAL_MAGIC_BE: u32 = 0x377F_0683;
/// Format version.
pub const WAL_FORMAT_VERSION: u32 = 3_007_000;

/// The two running checksum words.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalChecksum {
    pub s1: u32,
    pub s2: u32,
}

/// The salt pair identifying one WAL generation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalSalts {
    pub salt1: u32,
    pub salt2: u32,
}

/// Advance `seed` over `data`, which must be a multiple of 8 bytes.
pub fn advance_checksum(data: &[u8], seed: WalChecksum, big_endian: bool) -> Result<WalChecksum> {
    if data.len() % 8 != 0 {
        return Err(StrataError::WalCorrupt {
            detail: format!("checksum input not 8-byte aligned: {} bytes", data.len()),
        });
    }
    let mut s1 = seed.s1;
    let mut s2 = seed.s2;
    for pair in data.chunks_exact(8) {
        let w0 = decode_word(&pair[..4], big_endian);
        let w1 = decode_word(&pair[4..], big_endian);
        s1 = s1.wrapping_add(w0).wrapping_add(s2);
        s2 = s2.wrapping_add(w1).wrapping_add(s1);
    }
    Ok(WalChecksum { s1, s2 })
}

#[inline]
fn decode_word(bytes: &[u8], big_endian: bool) -> u32 {
    let arr = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if big_endian {
        u32::from_be_bytes(arr)
    } else {
        u32::from_le_bytes(arr)
    }
}

/// Checksum of a complete frame (header first 8 bytes + page image),
/// chained from `seed`.
pub fn frame_checksum(
    frame: &[u8],
    page_size: usize,
    seed: WalChecksum,
    big_endian: bool,
) -> Result<WalChecksum> {
    if frame.len() < WAL_FRAME_HEADER_SIZE + page_size {
        return Err(StrataError::WalCorrupt {
            detail: format!(
                "frame too small: {} < {}",
                frame.len(),
                WAL_FRAME_HEADER_SIZE + page_size
            ),
        });
    }
    let after_header = advance_checksum(&frame[..8], seed, big_endian)?;
    advance_checksum(
        &frame[WAL_FRAME_HEADER_SIZE..WAL_FRAME_HEADER_SIZE + page_size],
        after_header,
        big_endian,
    )
}

/// Parsed 32-byte WAL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: u32,
    pub format_version: u32,
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salts: WalSalts,
    pub checksum: WalChecksum,
}

impl WalHeader {
    /// Whether checksum words are big-endian for this WAL.
    #[must_use]
    pub const fn big_endian(&self) -> bool {
        self.magic == WAL_MAGIC_BE
    }

    /// Parse and structurally validate (magic, version); the checksum is
    /// verified separately so callers can report it distinctly.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < WAL_HEADER_SIZE {
            return Err(StrataError::WalCorrupt {
                detail: format!("WAL header needs {WAL_HEADER_SIZE} bytes, got {}", buf.len()),
            });
        }
        let magic = read_be_u32(buf, 0);
        if magic != WAL_MAGIC_LE && magic != WAL_MAGIC_BE {
            return Err(StrataError::WalCorrupt {
                detail: format!("invalid WAL magic: {magic:#010x}"),
            });
        }
        let format_version = read_be_u32(buf, 4);
        if format_version != WAL_FORMAT_VERSION {
            return Err(StrataError::WalCorrupt {
                detail: format!("unsupported WAL version: {format_version}"),
            });
        }
        Ok(Self {
            magic,
            format_version,
            page_size: read_be_u32(buf, 8),
            checkpoint_seq: read_be_u32(buf, 12),
            salts: WalSalts {
                salt1: read_be_u32(buf, 16),
                salt2: read_be_u32(buf, 20),
            },
            checksum: WalChecksum {
                s1: read_be_u32(buf, 24),
                s2: read_be_u32(buf, 28),
            },
        })
    }

    /// Verify the stored header checksum against a recomputation.
    pub fn verify_checksum(&self, buf: &[u8]) -> Result<WalChecksum> {
        let computed = advance_checksum(&buf[..24], WalChecksum::default(), self.big_endian())?;
        if computed != self.checksum {
            return Err(StrataError::WalCorrupt {
                detail: "WAL header checksum mismatch".to_owned(),
            });
        }
        Ok(computed)
    }

    /// Serialize, computing and embedding the header checksum.
    pub fn to_bytes(&self) -> Result<[u8; WAL_HEADER_SIZE]> {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        write_be_u32(&mut buf, 0, self.magic);
        write_be_u32(&mut buf, 4, self.format_version);
        write_be_u32(&mut buf, 8, self.page_size);
        write_be_u32(&mut buf, 12, self.checkpoint_seq);
        write_be_u32(&mut buf, 16, self.salts.salt1);
        write_be_u32(&mut buf, 20, self.salts.salt2);
        let checksum = advance_checksum(&buf[..24], WalChecksum::default(), self.big_endian())?;
        write_be_u32(&mut buf, 24, checksum.s1);
        write_be_u32(&mut buf, 28, checksum.s2);
        Ok(buf)
    }
}

/// Parsed 24-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFrameHeader {
    /// Page this frame carries an image of.
    pub page_number: u32,
    /// Database size in pages for the last frame of a committing
    /// transaction; 0 on all other frames.
    pub commit_mark: u32,
    /// Salt pair; must match the WAL header to belong to this generation.
    pub salts: WalSalts,
    /// Cumulative checksum through this frame.
    pub checksum: WalChecksum,
}

impl WalFrameHeader {
    /// Whether this frame ends a committed transaction.
    #[must_use]
    pub const fn is_commit(&self) -> bool {
        self.commit_mark > 0
    }

    /// Parse a frame header.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < WAL_FRAME_HEADER_SIZE {
            return Err(StrataError::WalCorrupt {
                detail: format!(
                    "frame header needs {WAL_FRAME_HEADER_SIZE} bytes, got {}",
                    buf.len()
                ),
            });
        }
        Ok(Self {
            page_number: read_be_u32(buf, 0),
            commit_mark: read_be_u32(buf, 4),
            salts: WalSalts {
                salt1: read_be_u32(buf, 8),
                salt2: read_be_u32(buf, 12),
            },
            checksum: WalChecksum {
                s1: read_be_u32(buf, 16),
                s2: read_be_u32(buf, 20),
            },
        })
    }

    /// Serialize. The checksum field is written as given; compute it with
    /// [`frame_checksum`] over the complete frame first.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; WAL_FRAME_HEADER_SIZE] {
        let mut buf = [0u8; WAL_FRAME_HEADER_SIZE];
        write_be_u32(&mut buf, 0, self.page_number);
        write_be_u32(&mut buf, 4, self.commit_mark);
        write_be_u32(&mut buf, 8, self.salts.salt1);
        write_be_u32(&mut buf, 12, self.salts.salt2);
        write_be_u32(&mut buf, 16, self.checksum.s1);
        write_be_u32(&mut buf, 20, self.checksum.s2);
        buf
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
