//! Log manager: append engine, rollback, checkpoints, and recovery.

use crate::record::{self, decode_record, LogRecord, RecordKind, UpdateRecord};
use parking_lot::Mutex;
use quarry_buffer::BufferManager;
use quarry_common::{BlockFile, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// A log manager shared between the transaction manager and the heap layer.
///
/// The WAL and the buffer manager are independently owned; WAL operations
/// borrow the buffer manager for the duration of the call only.
pub type SharedLogManager = Arc<Mutex<LogManager>>;

/// The write-ahead log.
///
/// Owns exactly one log file, formatted as a concatenation of variable-length
/// records. Appends are the only mutation to already-written bytes, and every
/// append writes the record's tag byte last so that a torn append leaves the
/// record invisible to scans.
pub struct LogManager {
    log_file: Box<dyn BlockFile>,
    /// Next free byte in the log file.
    current_offset: u64,
    /// Maps each live transaction to the ordinal of its BEGIN record, i.e.
    /// the total number of records written before it.
    txn_first_record: BTreeMap<u64, u64>,
    /// Count of records of each kind present in the log.
    kind_counts: BTreeMap<RecordKind, u64>,
    /// Dirty page ids snapshotted at the start of an in-progress fuzzy
    /// checkpoint; empty otherwise.
    fuzzy_pending_pages: Vec<u64>,
}

impl LogManager {
    /// Creates a log manager over the given log file.
    pub fn new(log_file: Box<dyn BlockFile>) -> Self {
        Self {
            log_file,
            current_offset: 0,
            txn_first_record: BTreeMap::new(),
            kind_counts: zeroed_counts(),
            fuzzy_pending_pages: Vec::new(),
        }
    }

    /// Re-points the log manager at a fresh file handle and clears all
    /// in-memory state. Used by the crash simulator before `recovery`.
    pub fn reset(&mut self, log_file: Box<dyn BlockFile>) {
        self.log_file = log_file;
        self.current_offset = 0;
        self.txn_first_record.clear();
        self.kind_counts = zeroed_counts();
        self.fuzzy_pending_pages.clear();
    }

    /// Returns the total number of records in the log.
    pub fn total_records(&self) -> u64 {
        self.kind_counts.values().sum()
    }

    /// Returns the number of records of the given kind.
    pub fn records_of_kind(&self, kind: RecordKind) -> u64 {
        self.kind_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Returns the next free byte offset in the log file.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Appends a BEGIN record and registers the transaction as live, keyed to
    /// the count of records written before this BEGIN.
    pub fn append_begin(&mut self, txn_id: u64) -> Result<()> {
        let ordinal = self.total_records();
        self.append_record(RecordKind::Begin, &txn_id.to_ne_bytes())?;
        self.txn_first_record.insert(txn_id, ordinal);
        Ok(())
    }

    /// Appends a COMMIT record and retires the transaction.
    pub fn append_commit(&mut self, txn_id: u64) -> Result<()> {
        self.append_record(RecordKind::Commit, &txn_id.to_ne_bytes())?;
        self.txn_first_record.remove(&txn_id);
        Ok(())
    }

    /// Appends an ABORT record, rolls the transaction back, and retires it.
    ///
    /// The ABORT record goes into the log before the rollback starts; the
    /// rollback scan stops at it.
    pub fn append_abort(&mut self, txn_id: u64, buffer_manager: &BufferManager) -> Result<()> {
        self.append_record(RecordKind::Abort, &txn_id.to_ne_bytes())?;
        self.rollback(txn_id, buffer_manager)?;
        self.txn_first_record.remove(&txn_id);
        Ok(())
    }

    /// Appends an UPDATE record carrying before and after images of `length`
    /// bytes at `offset` within the page.
    pub fn append_update(
        &mut self,
        txn_id: u64,
        page_id: u64,
        length: u64,
        offset: u64,
        before_img: &[u8],
        after_img: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(before_img.len() as u64, length);
        debug_assert_eq!(after_img.len() as u64, length);
        let payload =
            record::encode_update_payload(txn_id, page_id, length, offset, before_img, after_img);
        self.append_record(RecordKind::Update, &payload)
    }

    /// Sharp checkpoint: synchronously flushes every dirty page, then appends
    /// a CHECKPOINT marker. Every UPDATE before the marker is durable.
    pub fn append_checkpoint(&mut self, buffer_manager: &BufferManager) -> Result<()> {
        buffer_manager.flush_all_pages()?;
        self.append_record(RecordKind::Checkpoint, &[])?;
        debug!(offset = self.current_offset, "sharp checkpoint");
        Ok(())
    }

    /// Starts a fuzzy checkpoint: snapshots the dirty page ids, appends a
    /// BEGIN_FUZZY_CHECKPOINT marker, and returns the snapshot's length.
    pub fn fuzzy_begin(&mut self, buffer_manager: &BufferManager) -> Result<usize> {
        self.fuzzy_pending_pages = buffer_manager.get_dirty_page_ids();
        self.append_record(RecordKind::BeginFuzzyCheckpoint, &[])?;
        debug!(pages = self.fuzzy_pending_pages.len(), "fuzzy checkpoint started");
        Ok(self.fuzzy_pending_pages.len())
    }

    /// Performs one fuzzy checkpoint step by flushing the page snapshotted at
    /// index `step`. Steps may run in any order, be skipped, or repeated;
    /// out-of-range indices are a silent no-op.
    pub fn fuzzy_step(&mut self, buffer_manager: &BufferManager, step: usize) -> Result<()> {
        let Some(&page_id) = self.fuzzy_pending_pages.get(step) else {
            return Ok(());
        };
        buffer_manager.flush_page(page_id)
    }

    /// Ends the fuzzy checkpoint: appends an END_FUZZY_CHECKPOINT marker and
    /// drops the snapshot.
    pub fn fuzzy_end(&mut self) -> Result<()> {
        self.append_record(RecordKind::EndFuzzyCheckpoint, &[])?;
        self.fuzzy_pending_pages.clear();
        Ok(())
    }

    /// Undoes the effects of a live transaction by applying the before-images
    /// of its UPDATE records in reverse order of appearance.
    ///
    /// A no-op for transactions that are not live (never begun, or already
    /// committed or aborted). An ABORT record for the transaction terminates
    /// the scan: an already-aborted transaction has nothing further to undo.
    pub fn rollback(&mut self, txn_id: u64, buffer_manager: &BufferManager) -> Result<()> {
        if !self.txn_first_record.contains_key(&txn_id) {
            return Ok(());
        }

        let end = self.current_offset;
        let mut undo: Vec<UpdateRecord> = Vec::new();
        let mut offset = 0;
        while let Some((record, next)) = decode_record(self.log_file.as_mut(), offset, end)? {
            match record {
                LogRecord::Update(update) if update.txn_id == txn_id => undo.push(update),
                LogRecord::Abort { txn_id: aborted } if aborted == txn_id => break,
                _ => {}
            }
            offset = next;
        }

        // Updates of one transaction may overlap; undoing newest-first makes
        // the earliest before-image land last, restoring the original bytes.
        for update in undo.iter().rev() {
            apply_image(buffer_manager, update, &update.before_img)?;
        }
        Ok(())
    }

    /// Restores the buffer pool to a transactionally consistent state from a
    /// freshly reopened log.
    ///
    /// A single forward scan rebuilds the kind counts and the live
    /// transaction set while tracking which UPDATEs may not have reached
    /// durable storage: a CHECKPOINT clears all redo state, a completed
    /// BEGIN_FUZZY..END_FUZZY pair clears everything from before its begin,
    /// and an unpaired BEGIN_FUZZY leaves its region suspect. Aborted
    /// transactions get their after-images re-applied first (the crash may
    /// have interrupted their rollback), then aborted and still-live
    /// transactions are rolled back.
    pub fn recovery(&mut self, buffer_manager: &BufferManager) -> Result<()> {
        self.kind_counts = zeroed_counts();
        self.current_offset = self.log_file.size()?;
        self.txn_first_record.clear();
        self.fuzzy_pending_pages.clear();

        let end = self.current_offset;
        let mut since_checkpoint: Vec<UpdateRecord> = Vec::new();
        let mut pending_from_fuzzy: Vec<UpdateRecord> = Vec::new();
        let mut aborted_txns: BTreeSet<u64> = BTreeSet::new();

        let mut offset = 0;
        while let Some((record, next)) = decode_record(self.log_file.as_mut(), offset, end)? {
            offset = next;
            match record {
                LogRecord::Checkpoint => {
                    self.bump(RecordKind::Checkpoint);
                    // Everything logged so far is known durable.
                    since_checkpoint.clear();
                    pending_from_fuzzy.clear();
                }
                LogRecord::BeginFuzzyCheckpoint => {
                    self.bump(RecordKind::BeginFuzzyCheckpoint);
                    pending_from_fuzzy.append(&mut since_checkpoint);
                }
                LogRecord::EndFuzzyCheckpoint => {
                    self.bump(RecordKind::EndFuzzyCheckpoint);
                    // The fuzzy checkpoint completed: updates from before its
                    // begin are durable now.
                    pending_from_fuzzy.clear();
                }
                LogRecord::Begin { txn_id } => {
                    let ordinal = self.total_records();
                    self.txn_first_record.insert(txn_id, ordinal);
                    self.bump(RecordKind::Begin);
                }
                LogRecord::Commit { txn_id } => {
                    self.txn_first_record.remove(&txn_id);
                    self.bump(RecordKind::Commit);
                }
                LogRecord::Abort { txn_id } => {
                    aborted_txns.insert(txn_id);
                    self.bump(RecordKind::Abort);
                }
                LogRecord::Update(update) => {
                    since_checkpoint.push(update);
                    self.bump(RecordKind::Update);
                }
            }
        }

        // An unpaired BEGIN_FUZZY gives no durability guarantee: its whole
        // region joins the redo candidates.
        let candidates = if pending_from_fuzzy.is_empty() {
            since_checkpoint
        } else {
            pending_from_fuzzy.append(&mut since_checkpoint);
            pending_from_fuzzy
        };

        // An aborted transaction may have crashed mid-rollback. Re-applying
        // its after-images restores a canonical write-then-undo sequence so
        // the rollback below starts from a uniform state.
        for update in &candidates {
            if aborted_txns.contains(&update.txn_id) {
                apply_image(buffer_manager, update, &update.after_img)?;
            }
        }

        for &txn_id in &aborted_txns {
            self.rollback(txn_id, buffer_manager)?;
            self.txn_first_record.remove(&txn_id);
        }

        let open_txns: Vec<u64> = self
            .txn_first_record
            .keys()
            .copied()
            .filter(|txn_id| !aborted_txns.contains(txn_id))
            .collect();
        for &txn_id in &open_txns {
            self.rollback(txn_id, buffer_manager)?;
            self.txn_first_record.remove(&txn_id);
        }

        info!(
            total_records = self.total_records(),
            aborted = aborted_txns.len(),
            undone = open_txns.len(),
            "recovery complete"
        );
        Ok(())
    }

    /// Appends one record: grows the file, writes the payload, writes the tag
    /// byte last, then advances the offset and the kind count.
    fn append_record(&mut self, kind: RecordKind, payload: &[u8]) -> Result<()> {
        let record_len = record::TAG_LEN + payload.len() as u64;
        self.log_file.resize(self.current_offset + record_len)?;
        if !payload.is_empty() {
            self.log_file
                .write_block(payload, self.current_offset + record::TAG_LEN)?;
        }
        // Tag goes in last: a reader never sees a record whose payload is
        // not fully written.
        self.log_file.write_block(&[kind as u8], self.current_offset)?;
        self.current_offset += record_len;
        self.bump(kind);
        Ok(())
    }

    fn bump(&mut self, kind: RecordKind) {
        *self.kind_counts.entry(kind).or_insert(0) += 1;
    }
}

fn zeroed_counts() -> BTreeMap<RecordKind, u64> {
    RecordKind::ALL.iter().map(|&kind| (kind, 0)).collect()
}

/// Copies an image into a page through the buffer manager, leaving the page
/// unfixed and dirty.
fn apply_image(
    buffer_manager: &BufferManager,
    update: &UpdateRecord,
    image: &[u8],
) -> Result<()> {
    let frame = buffer_manager.fix_page(update.page_id, true)?;
    {
        let mut data = frame.data_mut();
        let start = update.offset as usize;
        data[start..start + update.length as usize].copy_from_slice(image);
    }
    buffer_manager.unfix_page(frame, true);
    Ok(())
}
