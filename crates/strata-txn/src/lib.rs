pub mod counters;
pub mod lock;
pub mod recovery;
pub mod txn;

pub use counters::{CounterSnapshot, Counters};
pub use lock::LockManager;
pub use recovery::{read_header, recover, RecoveryReport};
pub use txn::{journal_path, wal_path, Transaction, TxnConfig, TxnManager, TxnManagerArgs, TxnStatus};
