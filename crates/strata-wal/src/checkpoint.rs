//! Checkpoint execution: promote committed WAL frames into the main file.
//!
//! The safe watermark is the frame count no active reader's snapshot
//! predates. Backfill copies the newest frame image per page (among the
//! first `watermark` frames) into the main file in ascending page order,
//! syncs it, and — for the resetting modes — recycles the WAL with fresh
//! salts.

use std::collections::BTreeMap;

use strata_error::{Result, StrataError};
use strata_types::cx::Cx;
use strata_types::CheckpointMode;
use tracing::{debug, info};

use crate::checksum::WalSalts;
use crate::wal::WalFile;

/// Write-back interface to the main database file.
///
/// Defined here (not in the pager crate) so the dependency edge stays
/// one-way: the pager side implements it and hands it in at runtime.
pub trait CheckpointPageWriter {
    /// Write a page image to the main file.
    fn write_page(&mut self, cx: &Cx, page_number: u32, data: &[u8]) -> Result<()>;

    /// Truncate the main file to `pages` pages.
    fn truncate(&mut self, cx: &Cx, pages: u32) -> Result<()>;

    /// Sync the main file.
    fn sync(&mut self, cx: &Cx) -> Result<()>;
}

/// Outcome of one checkpoint run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    /// Frames whose images were copied into the main file.
    pub frames_backfilled: usize,
    /// Frame count the backfill stopped at.
    pub watermark: usize,
    /// Whether the WAL was reset (truncated + new salts).
    pub reset: bool,
}

/// Run a checkpoint.
///
/// `safe_watermark` is the caller-computed bound from active reader marks;
/// `fresh_salts` are used only when the mode resets the WAL. `Full`,
/// `Restart`, and `Truncate` require the watermark to cover every frame
/// and return `Busy` when a reader still pins an older snapshot.
pub fn execute_checkpoint(
    cx: &Cx,
    wal: &mut WalFile,
    writer: &mut dyn CheckpointPageWriter,
    mode: CheckpointMode,
    safe_watermark: usize,
    fresh_salts: WalSalts,
) -> Result<CheckpointResult> {
    let total = wal.frame_count();
    // Never backfill a partial transaction: clamp down to the last commit
    // boundary at or below the caller's watermark.
    let mut watermark = safe_watermark.min(total);
    while watermark > 0 && wal.frames()[watermark - 1].commit_mark == 0 {
        watermark -= 1;
    }

    if matches!(
        mode,
        CheckpointMode::Full | CheckpointMode::Restart | CheckpointMode::Truncate
    ) && watermark < total
    {
        return Err(StrataError::Busy);
    }

    if watermark == 0 {
        let reset = should_reset(mode) && total == 0;
        if reset {
            wal.reset(cx, fresh_salts)?;
        }
        return Ok(CheckpointResult {
            frames_backfilled: 0,
            watermark: 0,
            reset,
        });
    }

    // Newest frame per page within the watermark, plus the db size declared
    // by the last commit mark in range.
    let mut newest: BTreeMap<u32, usize> = BTreeMap::new();
    let mut db_size = 0u32;
    for (index, frame) in wal.frames()[..watermark].iter().enumerate() {
        newest.insert(frame.page_number, index);
        if frame.commit_mark > 0 {
            db_size = frame.commit_mark;
        }
    }
    debug_assert!(db_size > 0, "watermark always ends at a commit boundary");

    let mut backfilled = 0usize;
    for (page_number, frame_index) in &newest {
        cx.checkpoint()?;
        let image = wal.read_frame_page(cx, *frame_index)?;
        writer.write_page(cx, *page_number, image.as_bytes())?;
        backfilled += 1;
        debug!(page = page_number, frame = frame_index, "checkpoint backfill");
    }
    writer.truncate(cx, db_size)?;
    writer.sync(cx)?;

    let reset = should_reset(mode);
    if reset {
        wal.reset(cx, fresh_salts)?;
    }

    info!(
        mode = ?mode,
        frames_backfilled = backfilled,
        watermark,
        reset,
        "checkpoint complete"
    );
    Ok(CheckpointResult {
        frames_backfilled: backfilled,
        watermark,
        reset,
    })
}

const fn should_reset(mode: CheckpointMode) -> bool {
    matches!(mode, CheckpointMode::Restart | CheckpointMode::Truncate)
}
