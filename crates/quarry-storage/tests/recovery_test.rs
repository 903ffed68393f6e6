//! End-to-end crash recovery tests.
//!
//! Each test drives transactions through the heap segment on a small
//! buffer pool (128-byte pages, 10 frames), simulates a crash by discarding
//! the pool and re-opening the log, runs recovery, and checks exactly which
//! tuples survived. Tuples are 16 bytes: `(table_id: u64, field: u64)`.

use parking_lot::Mutex;
use quarry_buffer::BufferManager;
use quarry_common::{FsFile, StorageConfig};
use quarry_storage::{HeapSegment, SlottedPage, TupleId};
use quarry_wal::{LogManager, RecordKind, SharedLogManager, TransactionManager};
use std::sync::Arc;
use tempfile::TempDir;

const HEAP_SEGMENT: u64 = 123;
const TABLE_ID: u64 = 101;
const TUPLE_SIZE: usize = 16;

/// Field value meaning "skip this insert".
const INVALID_FIELD: u64 = u64::MAX;

struct TestDb {
    _dir: TempDir,
    config: StorageConfig,
    buffer: Arc<BufferManager>,
    log: SharedLogManager,
}

impl TestDb {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            page_size: 128,
            buffer_frames: 10,
            ..StorageConfig::default()
        };
        let buffer = Arc::new(
            BufferManager::new(config.page_size, config.buffer_frames, &config.data_dir).unwrap(),
        );
        let log_file = FsFile::open(config.log_file_path()).unwrap();
        let log: SharedLogManager =
            Arc::new(Mutex::new(LogManager::new(Box::new(log_file))));
        Self {
            _dir: dir,
            config,
            buffer,
            log,
        }
    }

    fn heap(&self, segment_id: u64) -> HeapSegment {
        HeapSegment::new(segment_id, self.log.clone(), self.buffer.clone())
    }

    fn txn_manager(&self) -> TransactionManager {
        TransactionManager::new(self.log.clone(), self.buffer.clone())
    }

    /// Simulates a crash: drops the buffer pool, re-points the WAL at a
    /// freshly opened handle of the same log file, and runs recovery.
    fn crash_and_recover(&self, txn: &mut TransactionManager) {
        self.buffer.discard_all_pages();
        let mut log = self.log.lock();
        log.reset(Box::new(FsFile::open(self.config.log_file_path()).unwrap()));
        txn.reset();
        log.recovery(&self.buffer).unwrap();
    }

    fn total_records(&self) -> u64 {
        self.log.lock().total_records()
    }

    fn records_of_kind(&self, kind: RecordKind) -> u64 {
        self.log.lock().records_of_kind(kind)
    }
}

fn insert_row(
    heap: &mut HeapSegment,
    txn: &mut TransactionManager,
    txn_id: u64,
    table_id: u64,
    field: u64,
) -> TupleId {
    let tid = heap.allocate(TUPLE_SIZE).unwrap();

    let mut buf = [0u8; TUPLE_SIZE];
    buf[0..8].copy_from_slice(&table_id.to_ne_bytes());
    buf[8..16].copy_from_slice(&field.to_ne_bytes());
    heap.write(tid, &buf, txn_id).unwrap();

    let page_id = BufferManager::overall_page_id(heap.segment_id(), tid.segment_page());
    txn.add_modified_page(txn_id, page_id);
    tid
}

/// Checks whether a tuple with the given field is, or is not, present
/// exactly once in the segment.
fn look(db: &TestDb, heap: &HeapSegment, expected_field: u64, should_be_present: bool) -> bool {
    let mut count = 0;

    for segment_page in 0..heap.page_count() {
        let page_id = BufferManager::overall_page_id(heap.segment_id(), segment_page);
        let frame = db.buffer.fix_page(page_id, false).unwrap();
        {
            let data = frame.data();
            for slot in 0..SlottedPage::slot_count(&data) {
                if let Some(range) = SlottedPage::tuple_range(&data, slot) {
                    let field_bytes: [u8; 8] = data[range.start + 8..range.start + 16]
                        .try_into()
                        .unwrap();
                    if u64::from_ne_bytes(field_bytes) == expected_field {
                        count += 1;
                    }
                }
            }
        }
        db.buffer.unfix_page(frame, false);
    }

    match count {
        0 => !should_be_present,
        1 => should_be_present,
        _ => false,
    }
}

/// Inserts up to two fields under one transaction and commits, flushing all
/// pages between the inserts.
fn do_insert(
    db: &TestDb,
    heap: &mut HeapSegment,
    txn: &mut TransactionManager,
    field_1: u64,
    field_2: u64,
) {
    let txn_id = txn.start_txn().unwrap();

    if field_1 != INVALID_FIELD {
        insert_row(heap, txn, txn_id, TABLE_ID, field_1);
    }

    db.buffer.flush_all_pages().unwrap();

    if field_2 != INVALID_FIELD {
        insert_row(heap, txn, txn_id, TABLE_ID, field_2);
    }

    txn.commit_txn(txn_id).unwrap();
}

/// Forces dirty pages to disk (defeating no-steal) and aborts.
fn abort(db: &TestDb, txn: &mut TransactionManager, txn_id: u64) {
    db.buffer.flush_all_pages().unwrap();
    txn.abort_txn(txn_id).unwrap();
}

/// Inserts up to two fields under one transaction, then aborts it with its
/// dirty pages already on disk.
fn dont_insert(
    db: &TestDb,
    heap: &mut HeapSegment,
    txn: &mut TransactionManager,
    field_1: u64,
    field_2: u64,
) {
    let txn_id = txn.start_txn().unwrap();

    if field_1 != INVALID_FIELD {
        insert_row(heap, txn, txn_id, TABLE_ID, field_1);
    }
    if field_2 != INVALID_FIELD {
        insert_row(heap, txn, txn_id, TABLE_ID, field_2);
    }

    abort(db, txn, txn_id);
}

#[test]
fn log_record_counts_after_commit() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    do_insert(&db, &mut heap, &mut txn, 5, 10);

    // One BEGIN, two UPDATEs, one COMMIT.
    assert_eq!(db.total_records(), 4);
    assert_eq!(db.records_of_kind(RecordKind::Update), 2);
}

#[test]
fn flushed_pages_survive_pool_discard() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    do_insert(&db, &mut heap, &mut txn, 5, 10);

    assert!(look(&db, &heap, 5, true));
    assert!(look(&db, &heap, 10, true));
    assert!(look(&db, &heap, 3, false));

    let txn_id = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_id, TABLE_ID, 3);

    db.buffer.flush_all_pages().unwrap();
    db.buffer.discard_all_pages();

    assert!(look(&db, &heap, 3, true));
}

#[test]
fn committed_data_survives_crash() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    do_insert(&db, &mut heap, &mut txn, 5, 10);

    db.crash_and_recover(&mut txn);

    assert!(look(&db, &heap, 5, true));
    assert!(look(&db, &heap, 10, true));
    assert!(look(&db, &heap, 3, false));
}

#[test]
fn aborted_data_is_not_visible() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    do_insert(&db, &mut heap, &mut txn, 5, 10);
    dont_insert(&db, &mut heap, &mut txn, 3, 4);

    assert!(look(&db, &heap, 5, true));
    assert!(look(&db, &heap, 10, true));
    assert!(look(&db, &heap, 3, false));
    assert!(look(&db, &heap, 4, false));
}

#[test]
fn interleaved_abort_and_commit() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    let txn_1 = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_1, TABLE_ID, 5);

    let txn_2 = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_2, TABLE_ID, 3);
    insert_row(&mut heap, &mut txn, txn_2, TABLE_ID, 4);
    txn.commit_txn(txn_2).unwrap();

    insert_row(&mut heap, &mut txn, txn_1, TABLE_ID, 10);
    abort(&db, &mut txn, txn_1);

    assert!(look(&db, &heap, 3, true));
    assert!(look(&db, &heap, 4, true));
    assert!(look(&db, &heap, 5, false));
    assert!(look(&db, &heap, 10, false));
}

#[test]
fn abort_then_crash_stays_consistent() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    do_insert(&db, &mut heap, &mut txn, 5, 10);
    dont_insert(&db, &mut heap, &mut txn, 3, 4);

    assert!(look(&db, &heap, 5, true));
    assert!(look(&db, &heap, 10, true));
    assert!(look(&db, &heap, 3, false));
    assert!(look(&db, &heap, 4, false));

    db.crash_and_recover(&mut txn);

    assert!(look(&db, &heap, 5, true));
    assert!(look(&db, &heap, 10, true));
    assert!(look(&db, &heap, 3, false));
    assert!(look(&db, &heap, 4, false));
}

#[test]
fn commit_abort_commit_then_crash() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    do_insert(&db, &mut heap, &mut txn, 5, 10);
    dont_insert(&db, &mut heap, &mut txn, 3, 4);
    do_insert(&db, &mut heap, &mut txn, 1, 2);

    let expected = [
        (5u64, true),
        (10, true),
        (3, false),
        (4, false),
        (1, true),
        (2, true),
    ];
    for (field, present) in expected {
        assert!(look(&db, &heap, field, present), "field {field} before crash");
    }

    db.crash_and_recover(&mut txn);

    for (field, present) in expected {
        assert!(look(&db, &heap, field, present), "field {field} after crash");
    }
}

#[test]
fn open_transaction_is_erased_by_recovery() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    let txn_id = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_id, TABLE_ID, 5);

    // Undo is required: the uncommitted bytes reach disk.
    db.buffer.flush_all_pages().unwrap();

    insert_row(&mut heap, &mut txn, txn_id, TABLE_ID, 10);

    db.crash_and_recover(&mut txn);

    assert!(look(&db, &heap, 5, false));
    assert!(look(&db, &heap, 10, false));
}

#[test]
fn only_committed_transaction_survives_crash() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    let txn_1 = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_1, TABLE_ID, 5);
    db.buffer.flush_all_pages().unwrap(); // defeat no-steal

    do_insert(&db, &mut heap, &mut txn, 3, 4);

    let txn_3 = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_3, TABLE_ID, 10);
    db.buffer.flush_all_pages().unwrap(); // defeat no-steal

    db.crash_and_recover(&mut txn);

    assert!(look(&db, &heap, 5, false));
    assert!(look(&db, &heap, 10, false));
    assert!(look(&db, &heap, 3, true));
    assert!(look(&db, &heap, 4, true));
}

#[test]
fn checkpoint_between_transactions() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    let txn_1 = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_1, TABLE_ID, 5);
    db.buffer.flush_all_pages().unwrap(); // defeat no-steal

    do_insert(&db, &mut heap, &mut txn, 3, 4);

    db.log.lock().append_checkpoint(&db.buffer).unwrap();

    let txn_3 = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_3, TABLE_ID, 10);
    db.buffer.flush_all_pages().unwrap(); // defeat no-steal

    db.crash_and_recover(&mut txn);

    assert_eq!(db.records_of_kind(RecordKind::Checkpoint), 1);
    assert!(look(&db, &heap, 5, false));
    assert!(look(&db, &heap, 10, false));
    assert!(look(&db, &heap, 3, true));
    assert!(look(&db, &heap, 4, true));
}

#[test]
fn fuzzy_checkpoint_completes_then_crash() {
    let db = TestDb::new();
    let mut heap_1 = db.heap(HEAP_SEGMENT);
    let mut heap_2 = db.heap(124);
    let mut txn = db.txn_manager();

    let table_1 = 101;
    let table_2 = 102;

    let txn_1 = txn.start_txn().unwrap();
    insert_row(&mut heap_1, &mut txn, txn_1, table_1, 5);

    let txn_2 = txn.start_txn().unwrap();
    insert_row(&mut heap_2, &mut txn, txn_2, table_2, 4);

    let txn_3 = txn.start_txn().unwrap();
    insert_row(&mut heap_2, &mut txn, txn_3, table_2, 3);
    txn.commit_txn(txn_3).unwrap();

    let txn_4 = txn.start_txn().unwrap();
    insert_row(&mut heap_1, &mut txn, txn_4, table_1, 9);

    // Commit forced heap 2's page out, so only heap 1's page is dirty here.
    let num_dirty = db.log.lock().fuzzy_begin(&db.buffer).unwrap();
    assert_eq!(num_dirty, 1);
    db.log.lock().fuzzy_step(&db.buffer, 0).unwrap();
    txn.commit_txn(txn_1).unwrap();

    insert_row(&mut heap_1, &mut txn, txn_4, table_1, 10);
    insert_row(&mut heap_2, &mut txn, txn_4, table_2, 11);

    db.log.lock().fuzzy_step(&db.buffer, 1).unwrap();
    db.log.lock().fuzzy_end().unwrap();

    insert_row(&mut heap_1, &mut txn, txn_2, table_1, 8);
    txn.commit_txn(txn_2).unwrap();

    assert_eq!(db.total_records(), 16);
    assert_eq!(db.records_of_kind(RecordKind::Begin), 4);
    assert_eq!(db.records_of_kind(RecordKind::Update), 7);
    assert_eq!(db.records_of_kind(RecordKind::Commit), 3);
    assert_eq!(db.records_of_kind(RecordKind::BeginFuzzyCheckpoint), 1);
    assert_eq!(db.records_of_kind(RecordKind::EndFuzzyCheckpoint), 1);
    assert_eq!(db.records_of_kind(RecordKind::Checkpoint), 0);
    assert_eq!(db.records_of_kind(RecordKind::Abort), 0);

    db.crash_and_recover(&mut txn);

    assert!(look(&db, &heap_2, 3, true));
    assert!(look(&db, &heap_2, 4, true));
    assert!(look(&db, &heap_1, 5, true));
    assert!(look(&db, &heap_1, 8, true));
    assert!(look(&db, &heap_1, 9, false));
    assert!(look(&db, &heap_1, 10, false));
    assert!(look(&db, &heap_2, 11, false));
}

#[test]
fn fuzzy_checkpoint_interrupted_by_crash() {
    let db = TestDb::new();
    let mut heap = db.heap(HEAP_SEGMENT);
    let mut txn = db.txn_manager();

    do_insert(&db, &mut heap, &mut txn, 1, 2);

    let txn_2 = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_2, TABLE_ID, 3);

    let txn_3 = txn.start_txn().unwrap();
    insert_row(&mut heap, &mut txn, txn_3, TABLE_ID, 4);

    assert_eq!(db.log.lock().fuzzy_begin(&db.buffer).unwrap(), 1);

    insert_row(&mut heap, &mut txn, txn_2, TABLE_ID, 5);
    insert_row(&mut heap, &mut txn, txn_3, TABLE_ID, 6);

    txn.commit_txn(txn_2).unwrap();

    insert_row(&mut heap, &mut txn, txn_3, TABLE_ID, 7);

    // Crash before the fuzzy checkpoint ends: updates from before its begin
    // must be re-examined, and the committed transaction must survive.
    db.crash_and_recover(&mut txn);

    assert!(look(&db, &heap, 1, true));
    assert!(look(&db, &heap, 2, true));
    assert!(look(&db, &heap, 3, true));
    assert!(look(&db, &heap, 4, false));
    assert!(look(&db, &heap, 5, true));
    assert!(look(&db, &heap, 6, false));
    assert!(look(&db, &heap, 7, false));
}
