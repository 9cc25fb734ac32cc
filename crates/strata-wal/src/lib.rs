pub mod checkpoint;
pub mod checksum;
pub mod wal;
pub mod wal_index;

pub use checkpoint::{execute_checkpoint, CheckpointPageWriter, CheckpointResult};
pub use checksum::{WalChecksum, WalFrameHeader, WalHeader, WalSalts};
pub use wal::{FrameInfo, WalFile};
pub use wal_index::WalIndex;
