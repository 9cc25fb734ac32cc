//! Flag sets passed across the VFS boundary.

use bitflags::bitflags;

bitflags! {
    /// Flags controlling how a VFS opens a file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VfsOpenFlags: u32 {
        /// Open for reading.
        const READONLY       = 0x0000_0001;
        /// Open for reading and writing.
        const READWRITE      = 0x0000_0002;
        /// Create the file if it does not exist.
        const CREATE         = 0x0000_0004;
        /// Fail if the file already exists (with CREATE).
        const EXCLUSIVE      = 0x0000_0010;
        /// Delete the file when the handle closes.
        const DELETE_ON_CLOSE = 0x0000_0020;
        /// The main database file.
        const MAIN_DB        = 0x0000_0100;
        /// A rollback journal.
        const JOURNAL        = 0x0000_0800;
        /// A write-ahead log.
        const WAL            = 0x0008_0000;
    }
}

bitflags! {
    /// Flags for VFS access probes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Does the file exist?
        const EXISTS    = 0x01;
        /// Is the file readable and writable?
        const READWRITE = 0x02;
    }
}

bitflags! {
    /// Flags controlling the strength of a durability sync.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        /// Normal fsync.
        const NORMAL   = 0x02;
        /// Full barrier (data and metadata).
        const FULL     = 0x03;
        /// Data only; file metadata (size) may be deferred.
        const DATAONLY = 0x10;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_compose() {
        let f = VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        assert!(f.contains(VfsOpenFlags::CREATE));
        assert!(!f.contains(VfsOpenFlags::WAL));
    }

    #[test]
    fn sync_flags_dataonly() {
        let f = SyncFlags::FULL | SyncFlags::DATAONLY;
        assert!(f.contains(SyncFlags::DATAONLY));
    }
}
