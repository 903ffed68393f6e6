//! Transaction orchestration over the WAL and the buffer manager.

use crate::manager::SharedLogManager;
use quarry_buffer::BufferManager;
use quarry_common::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Allocates transaction ids and drives begin/commit/abort, delegating
/// durability to the WAL.
///
/// Commit uses a force policy: the transaction's modified pages are flushed
/// before the COMMIT record is appended, so recovery never needs to redo
/// committed work. Abort delegates to the WAL's rollback. Callers register
/// the pages a transaction touches via `add_modified_page`.
pub struct TransactionManager {
    log: SharedLogManager,
    buffer: Arc<BufferManager>,
    next_txn_id: u64,
    modified_pages: BTreeMap<u64, BTreeSet<u64>>,
}

impl TransactionManager {
    /// Creates a transaction manager over the shared WAL and buffer manager.
    pub fn new(log: SharedLogManager, buffer: Arc<BufferManager>) -> Self {
        Self {
            log,
            buffer,
            next_txn_id: 1,
            modified_pages: BTreeMap::new(),
        }
    }

    /// Starts a new transaction: allocates its id and appends its BEGIN.
    pub fn start_txn(&mut self) -> Result<u64> {
        let txn_id = self.next_txn_id;
        self.next_txn_id += 1;
        self.log.lock().append_begin(txn_id)?;
        self.modified_pages.insert(txn_id, BTreeSet::new());
        Ok(txn_id)
    }

    /// Records that the transaction modified the given page.
    pub fn add_modified_page(&mut self, txn_id: u64, page_id: u64) {
        self.modified_pages.entry(txn_id).or_default().insert(page_id);
    }

    /// Commits the transaction: flushes its modified pages, then appends
    /// COMMIT.
    pub fn commit_txn(&mut self, txn_id: u64) -> Result<()> {
        if let Some(pages) = self.modified_pages.remove(&txn_id) {
            for page_id in pages {
                self.buffer.flush_page(page_id)?;
            }
        }
        self.log.lock().append_commit(txn_id)?;
        debug!(txn_id, "transaction committed");
        Ok(())
    }

    /// Aborts the transaction: the WAL appends ABORT and rolls it back.
    pub fn abort_txn(&mut self, txn_id: u64) -> Result<()> {
        self.modified_pages.remove(&txn_id);
        self.log.lock().append_abort(txn_id, &self.buffer)?;
        debug!(txn_id, "transaction aborted");
        Ok(())
    }

    /// Clears per-transaction state after a simulated crash.
    ///
    /// The id counter keeps advancing so post-recovery transactions never
    /// reuse an id already present in the log.
    pub fn reset(&mut self) {
        self.modified_pages.clear();
    }
}
