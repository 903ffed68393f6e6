//! Write-ahead log (WAL) and crash recovery for QuarryDB.
//!
//! Every mutation against the buffer pool is durably recorded before it takes
//! effect. The log supports per-transaction rollback by log scan, sharp and
//! fuzzy checkpoints, and a recovery procedure that restores the buffer pool
//! to a state reflecting exactly the committed transactions.

pub mod manager;
pub mod record;
pub mod txn;

pub use manager::{LogManager, SharedLogManager};
pub use record::{LogRecord, RecordKind, UpdateRecord};
pub use txn::TransactionManager;
