//! Heap segment: WAL-logged tuple storage over the buffer pool.

use crate::slotted::{SlottedPage, HEADER_SIZE, SLOT_SIZE};
use quarry_buffer::BufferManager;
use quarry_common::{QuarryError, Result};
use quarry_wal::SharedLogManager;
use std::sync::Arc;
use tracing::trace;

/// Identifier of a tuple within a segment.
///
/// Packs the segment-local page number into the high 48 bits and the slot id
/// into the low 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleId(u64);

impl TupleId {
    /// Creates a tuple id from a segment-local page number and a slot id.
    pub fn new(segment_page: u64, slot: u16) -> Self {
        Self((segment_page << 16) | slot as u64)
    }

    /// Returns the raw packed value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the segment-local page number.
    pub fn segment_page(&self) -> u64 {
        self.0 >> 16
    }

    /// Returns the slot id within the page.
    pub fn slot(&self) -> u16 {
        self.0 as u16
    }
}

impl std::fmt::Display for TupleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment_page(), self.slot())
    }
}

/// A heap of slotted pages within one segment.
///
/// Tuple writes are write-ahead logged: the UPDATE record with before and
/// after images reaches the log before the page bytes change. Slot directory
/// changes made by `allocate` are not logged; rollback restores tuple bytes,
/// so an undone tuple reads back as zeros in its slot.
pub struct HeapSegment {
    segment_id: u64,
    page_count: u64,
    log: SharedLogManager,
    buffer: Arc<BufferManager>,
}

impl HeapSegment {
    /// Creates a heap over the given segment id.
    pub fn new(segment_id: u64, log: SharedLogManager, buffer: Arc<BufferManager>) -> Self {
        Self {
            segment_id,
            page_count: 0,
            log,
            buffer,
        }
    }

    /// Returns the segment id.
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Returns the number of pages allocated in this segment.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Allocates a slot for a tuple of `size` bytes, first-fit over the
    /// existing pages, appending a fresh page when none has room.
    pub fn allocate(&mut self, size: usize) -> Result<TupleId> {
        let capacity = self.buffer.page_size() - HEADER_SIZE - SLOT_SIZE;
        if size > capacity {
            return Err(QuarryError::TupleTooLarge {
                size,
                max: capacity,
            });
        }

        for page in 0..self.page_count {
            let page_id = BufferManager::overall_page_id(self.segment_id, page);
            let frame = self.buffer.fix_page(page_id, true)?;
            let slot = {
                let mut data = frame.data_mut();
                if !SlottedPage::is_initialized(&data) {
                    // The page was lost before ever reaching its file; treat
                    // it as empty.
                    SlottedPage::init(&mut data);
                }
                SlottedPage::allocate_slot(&mut data, size)
            };
            match slot {
                Some(slot) => {
                    self.buffer.unfix_page(frame, true);
                    return Ok(TupleId::new(page, slot));
                }
                None => self.buffer.unfix_page(frame, false),
            }
        }

        let page = self.page_count;
        let page_id = BufferManager::overall_page_id(self.segment_id, page);
        let frame = self.buffer.fix_page(page_id, true)?;
        let slot = {
            let mut data = frame.data_mut();
            SlottedPage::init(&mut data);
            SlottedPage::allocate_slot(&mut data, size)
        };
        self.buffer.unfix_page(frame, true);
        self.page_count = page + 1;
        trace!(segment_id = self.segment_id, page, "appended heap page");

        // Fits by the capacity check above.
        let slot = slot.ok_or(QuarryError::TupleTooLarge {
            size,
            max: capacity,
        })?;
        Ok(TupleId::new(page, slot))
    }

    /// Writes tuple bytes on behalf of a transaction.
    ///
    /// Appends an UPDATE record carrying the before and after images of the
    /// written range, then copies the data into the page.
    pub fn write(&mut self, tid: TupleId, data: &[u8], txn_id: u64) -> Result<()> {
        let page_id = BufferManager::overall_page_id(self.segment_id, tid.segment_page());
        let frame = self.buffer.fix_page(page_id, true)?;

        let range = {
            let page = frame.data();
            SlottedPage::tuple_range(&page, tid.slot())
        };
        let Some(range) = range else {
            self.buffer.unfix_page(frame, false);
            return Err(QuarryError::TupleNotFound { tid: tid.value() });
        };
        if data.len() > range.len() {
            let max = range.len();
            self.buffer.unfix_page(frame, false);
            return Err(QuarryError::TupleTooLarge {
                size: data.len(),
                max,
            });
        }

        let start = range.start;
        let before = frame.data()[start..start + data.len()].to_vec();
        let logged = self.log.lock().append_update(
            txn_id,
            page_id,
            data.len() as u64,
            start as u64,
            &before,
            data,
        );
        if let Err(err) = logged {
            self.buffer.unfix_page(frame, false);
            return Err(err);
        }

        frame.data_mut()[start..start + data.len()].copy_from_slice(data);
        self.buffer.unfix_page(frame, true);
        Ok(())
    }

    /// Reads `buf.len()` bytes of the tuple into `buf`.
    pub fn read(&self, tid: TupleId, buf: &mut [u8]) -> Result<()> {
        let page_id = BufferManager::overall_page_id(self.segment_id, tid.segment_page());
        let frame = self.buffer.fix_page(page_id, false)?;

        let range = SlottedPage::tuple_range(&frame.data(), tid.slot());
        let result = match range {
            Some(range) if buf.len() <= range.len() => {
                let data = frame.data();
                buf.copy_from_slice(&data[range.start..range.start + buf.len()]);
                Ok(())
            }
            Some(range) => Err(QuarryError::TupleTooLarge {
                size: buf.len(),
                max: range.len(),
            }),
            None => Err(QuarryError::TupleNotFound { tid: tid.value() }),
        };
        self.buffer.unfix_page(frame, false);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use quarry_common::MemFile;
    use quarry_wal::{LogManager, RecordKind};
    use tempfile::{tempdir, TempDir};

    fn setup() -> (HeapSegment, SharedLogManager, Arc<BufferManager>, TempDir) {
        let dir = tempdir().unwrap();
        let buffer = Arc::new(BufferManager::new(128, 10, dir.path()).unwrap());
        let log: SharedLogManager =
            Arc::new(Mutex::new(LogManager::new(Box::new(MemFile::new()))));
        let heap = HeapSegment::new(123, log.clone(), buffer.clone());
        (heap, log, buffer, dir)
    }

    #[test]
    fn test_tuple_id_packing() {
        let tid = TupleId::new(5, 3);
        assert_eq!(tid.segment_page(), 5);
        assert_eq!(tid.slot(), 3);
        assert_eq!(tid.value(), (5 << 16) | 3);
        assert_eq!(tid.to_string(), "5:3");
    }

    #[test]
    fn test_allocate_fills_then_grows() {
        let (mut heap, _log, _bm, _dir) = setup();

        // Six 16-byte tuples fit on a 128-byte page.
        for i in 0..6 {
            let tid = heap.allocate(16).unwrap();
            assert_eq!(tid.segment_page(), 0);
            assert_eq!(tid.slot(), i);
        }
        assert_eq!(heap.page_count(), 1);

        let tid = heap.allocate(16).unwrap();
        assert_eq!(tid.segment_page(), 1);
        assert_eq!(tid.slot(), 0);
        assert_eq!(heap.page_count(), 2);
    }

    #[test]
    fn test_allocate_rejects_oversized_tuple() {
        let (mut heap, _log, _bm, _dir) = setup();
        assert!(matches!(
            heap.allocate(128),
            Err(QuarryError::TupleTooLarge { .. })
        ));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (mut heap, _log, _bm, _dir) = setup();

        let tid = heap.allocate(16).unwrap();
        let payload: Vec<u8> = (0..16).collect();
        heap.write(tid, &payload, 1).unwrap();

        let mut buf = [0u8; 16];
        heap.read(tid, &mut buf).unwrap();
        assert_eq!(&buf[..], &payload[..]);
    }

    #[test]
    fn test_write_logs_update_with_images() {
        let (mut heap, log, _bm, _dir) = setup();

        let tid = heap.allocate(8).unwrap();
        heap.write(tid, &[1u8; 8], 1).unwrap();
        heap.write(tid, &[2u8; 8], 1).unwrap();

        assert_eq!(log.lock().records_of_kind(RecordKind::Update), 2);
    }

    #[test]
    fn test_write_unknown_tuple() {
        let (mut heap, _log, _bm, _dir) = setup();
        heap.allocate(8).unwrap();

        let missing = TupleId::new(0, 9);
        assert!(matches!(
            heap.write(missing, &[0u8; 8], 1),
            Err(QuarryError::TupleNotFound { .. })
        ));
    }

    #[test]
    fn test_write_too_large_for_slot() {
        let (mut heap, _log, _bm, _dir) = setup();
        let tid = heap.allocate(8).unwrap();

        assert!(matches!(
            heap.write(tid, &[0u8; 9], 1),
            Err(QuarryError::TupleTooLarge { .. })
        ));
    }

    #[test]
    fn test_read_from_missing_page() {
        let (heap, _log, _bm, _dir) = setup();
        let mut buf = [0u8; 8];
        // Page 0 exists as zeros in the pool but holds no slots.
        assert!(heap.read(TupleId::new(0, 0), &mut buf).is_err());
    }
}
