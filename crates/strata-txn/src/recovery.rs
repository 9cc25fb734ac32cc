//! Crash recovery at open time.
//!
//! Two artifacts can outlive a crashed process:
//!
//! - a **hot rollback journal** (synced header, non-zero record count)
//!   means a write transaction died between its journal sync and its
//!   commit cleanup; the pre-images are replayed onto the main file and
//!   the journal is deleted, leaving the pre-transaction state; and
//! - a **WAL file**, whose checksum-valid, commit-terminated frame prefix
//!   is the committed tail of history; anything after the last valid
//!   commit frame is discarded by the scan.
//!
//! Both paths are idempotent: re-running recovery after a crash during
//! recovery converges to the same state.

use std::path::Path;
use std::sync::Arc;

use strata_error::{Result, StrataError};
use strata_pager::journal::read_records;
use strata_pager::Pager;
use strata_types::cx::Cx;
use strata_types::flags::{AccessFlags, VfsOpenFlags};
use strata_types::{CheckpointMode, DatabaseHeader, PageNumber};
use strata_vfs::Vfs;
use strata_wal::checkpoint::execute_checkpoint;
use strata_wal::{WalFile, WalIndex, WalSalts};
use tracing::{debug, info, warn};

use crate::txn::{journal_path, wal_path, PagerBackfill};

/// What recovery found and did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Journal pre-image records replayed onto the main file.
    pub journal_records_replayed: usize,
    /// Committed WAL frames found valid.
    pub wal_frames_recovered: usize,
    /// Whether a leftover WAL was checkpointed into the main file because
    /// the database is not operating in WAL mode.
    pub wal_absorbed: bool,
}

/// Run recovery for a freshly opened database.
///
/// `keep_wal` is true when the handle will operate in WAL mode: the
/// recovered WAL (if any) is then returned for continued use. Otherwise a
/// leftover WAL is absorbed into the main file and deleted.
pub fn recover(
    cx: &Cx,
    vfs: &Arc<dyn Vfs>,
    db_path: &Path,
    pager: &Pager,
    keep_wal: bool,
) -> Result<(RecoveryReport, Option<(WalFile, WalIndex)>)> {
    let mut report = RecoveryReport::default();

    replay_hot_journal(cx, vfs, db_path, pager, &mut report)?;
    let wal = absorb_or_adopt_wal(cx, vfs, db_path, pager, keep_wal, &mut report)?;

    if report.journal_records_replayed > 0 || report.wal_frames_recovered > 0 {
        info!(
            journal_records = report.journal_records_replayed,
            wal_frames = report.wal_frames_recovered,
            wal_absorbed = report.wal_absorbed,
            "recovery complete"
        );
    }
    Ok((report, wal))
}

fn replay_hot_journal(
    cx: &Cx,
    vfs: &Arc<dyn Vfs>,
    db_path: &Path,
    pager: &Pager,
    report: &mut RecoveryReport,
) -> Result<()> {
    let path = journal_path(db_path);
    if !vfs.access(cx, &path, AccessFlags::EXISTS)? {
        return Ok(());
    }

    let mut file = vfs.open(cx, &path, VfsOpenFlags::JOURNAL | VfsOpenFlags::READWRITE)?;
    let scan = read_records(cx, file.as_mut());
    file.close(cx)?;

    match scan? {
        Some((header, records)) if !records.is_empty() => {
            info!(
                records = records.len(),
                initial_db_size = header.initial_db_size,
                "hot journal found; replaying pre-images"
            );
            for record in &records {
                let page = PageNumber::new(record.page_number).ok_or_else(|| {
                    StrataError::JournalCorrupt {
                        detail: "journal record names page 0".to_owned(),
                    }
                })?;
                debug!(page = record.page_number, "journal pre-image replayed");
                pager.apply_page_image(cx, page, &record.image)?;
            }
            pager.truncate(cx, header.initial_db_size)?;
            pager.set_page_count(header.initial_db_size);
            pager.sync(cx)?;
            report.journal_records_replayed = records.len();
        }
        _ => {
            debug!("cold journal found; removing");
        }
    }

    vfs.delete(cx, &path, true)?;
    Ok(())
}

fn absorb_or_adopt_wal(
    cx: &Cx,
    vfs: &Arc<dyn Vfs>,
    db_path: &Path,
    pager: &Pager,
    keep_wal: bool,
    report: &mut RecoveryReport,
) -> Result<Option<(WalFile, WalIndex)>> {
    let path = wal_path(db_path);
    if !vfs.access(cx, &path, AccessFlags::EXISTS)? {
        return Ok(None);
    }

    let mut file = vfs.open(cx, &path, VfsOpenFlags::WAL | VfsOpenFlags::READWRITE)?;
    if file.file_size(cx)? == 0 {
        // An empty WAL carries nothing; treat it as absent.
        file.close(cx)?;
        if !keep_wal {
            vfs.delete(cx, &path, true)?;
        }
        return Ok(None);
    }

    // A torn or checksum-invalid header means the WAL never durably
    // started a generation: zero frames survive, exactly as if the file
    // were absent. (The checksum, not the file's presence, arbitrates.)
    let mut header_buf = [0u8; strata_wal::checksum::WAL_HEADER_SIZE];
    let n = file.read(cx, &mut header_buf, 0)?;
    let header_ok = n == header_buf.len()
        && strata_wal::WalHeader::parse(&header_buf)
            .and_then(|h| h.verify_checksum(&header_buf))
            .is_ok();
    if !header_ok {
        warn!("WAL header invalid; discarding the file as empty");
        file.close(cx)?;
        vfs.delete(cx, &path, true)?;
        return Ok(None);
    }

    let mut wal = WalFile::open(cx, file)?;
    report.wal_frames_recovered = wal.frame_count();

    if keep_wal {
        let index = WalIndex::build(wal.frames());
        if let Some(db_size) = wal.committed_db_size() {
            pager.set_page_count(db_size);
        }
        return Ok(Some((wal, index)));
    }

    // The database runs in journal mode: fold the committed frames into
    // the main file and drop the WAL.
    if wal.frame_count() > 0 {
        let watermark = wal.frame_count();
        let mut writer = PagerBackfill::new(pager);
        execute_checkpoint(
            cx,
            &mut wal,
            &mut writer,
            CheckpointMode::Passive,
            watermark,
            WalSalts::default(),
        )?;
        report.wal_absorbed = true;
    }
    wal.close(cx)?;
    vfs.delete(cx, &path, true)?;
    Ok(None)
}

/// Parse the database header after recovery has settled the file contents.
///
/// In WAL mode the newest committed page 1 may still live in a frame, so
/// the WAL is consulted before the main file.
pub fn read_header(
    cx: &Cx,
    pager: &Pager,
    wal: Option<&mut (WalFile, WalIndex)>,
) -> Result<DatabaseHeader> {
    if let Some((wal_file, index)) = wal {
        let watermark = u32::try_from(wal_file.frame_count()).unwrap_or(u32::MAX);
        if let Some(frame) = index.lookup(PageNumber::ONE.get(), watermark) {
            let image = wal_file.read_frame_page(cx, frame as usize)?;
            return DatabaseHeader::parse(image.as_bytes());
        }
    }
    let page = pager.get_page(cx, PageNumber::ONE)?;
    DatabaseHeader::parse(page.as_bytes())
}
