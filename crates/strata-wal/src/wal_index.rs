//! In-memory WAL index: page number → frames carrying that page.
//!
//! Readers resolve a page by asking for the newest frame at or below their
//! snapshot watermark (the frame count observed when they acquired Shared);
//! frames appended later stay invisible to them. The index is a per-handle
//! cache rebuilt from the WAL file, which remains the cross-process source
//! of truth.

use std::collections::HashMap;

use crate::wal::FrameInfo;

/// Map from page number to the ascending list of frame indices (0-based)
/// that carry an image of that page.
#[derive(Debug, Default)]
pub struct WalIndex {
    by_page: HashMap<u32, Vec<u32>>,
    frame_count: u32,
}

impl WalIndex {
    /// Empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a scanned frame list.
    #[must_use]
    pub fn build(frames: &[FrameInfo]) -> Self {
        let mut index = Self::new();
        for frame in frames {
            index.push(frame.page_number);
        }
        index
    }

    /// Record that the next frame (index `frame_count`) carries `page`.
    pub fn push(&mut self, page: u32) {
        self.by_page.entry(page).or_default().push(self.frame_count);
        self.frame_count += 1;
    }

    /// Number of frames the index covers.
    #[must_use]
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Newest frame index carrying `page` among the first `watermark`
    /// frames, or `None` if the reader must fall through to the main file.
    #[must_use]
    pub fn lookup(&self, page: u32, watermark: u32) -> Option<u32> {
        let frames = self.by_page.get(&page)?;
        // Ascending list: find the last entry < watermark.
        match frames.binary_search(&watermark) {
            Ok(0) | Err(0) => None,
            Ok(pos) | Err(pos) => Some(frames[pos - 1]),
        }
    }

    /// Drop all entries for frames at or beyond `frame_count` (rollback to
    /// a watermark).
    pub fn truncate(&mut self, frame_count: u32) {
        if frame_count >= self.frame_count {
            return;
        }
        self.by_page.retain(|_, frames| {
            frames.retain(|&f| f < frame_count);
            !frames.is_empty()
        });
        self.frame_count = frame_count;
    }

    /// Forget everything (WAL reset).
    pub fn clear(&mut self) {
        self.by_page.clear();
        self.frame_count = 0;
    }

    /// Distinct pages present in the index.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.by_page.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_honors_watermark() {
        let mut index = WalIndex::new();
        index.push(2); // frame 0
        index.push(3); // frame 1
        index.push(2); // frame 2

        assert_eq!(index.lookup(2, 3), Some(2));
        assert_eq!(index.lookup(2, 2), Some(0));
        assert_eq!(index.lookup(2, 1), Some(0));
        assert_eq!(index.lookup(2, 0), None);
        assert_eq!(index.lookup(3, 3), Some(1));
        assert_eq!(index.lookup(3, 1), None);
        assert_eq!(index.lookup(9, 3), None);
    }

    #[test]
    fn truncate_drops_later_frames() {
        let mut index = WalIndex::new();
        index.push(2);
        index.push(3);
        index.push(2);
        index.truncate(1);

        assert_eq!(index.frame_count(), 1);
        assert_eq!(index.lookup(2, 1), Some(0));
        assert_eq!(index.lookup(3, 1), None);
        assert_eq!(index.page_count(), 1);
    }

    #[test]
    fn truncate_past_end_is_noop() {
        let mut index = WalIndex::new();
        index.push(2);
        index.truncate(5);
        assert_eq!(index.frame_count(), 1);
    }

    #[test]
    fn build_matches_pushes() {
        use crate::checksum::WalChecksum;
        use crate::wal::FrameInfo;
        let frames = [
            FrameInfo {
                page_number: 5,
                commit_mark: 0,
                checksum: WalChecksum::default(),
            },
            FrameInfo {
                page_number: 7,
                commit_mark: 7,
                checksum: WalChecksum::default(),
            },
        ];
        let index = WalIndex::build(&frames);
        assert_eq!(index.frame_count(), 2);
        assert_eq!(index.lookup(5, 2), Some(0));
        assert_eq!(index.lookup(7, 2), Some(1));
    }

    #[test]
    fn clear_resets() {
        let mut index = WalIndex::new();
        index.push(1);
        index.clear();
        assert_eq!(index.frame_count(), 0);
        assert_eq!(index.lookup(1, 1), None);
    }
}
