//! Buffer frame holding a single page.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Sentinel value indicating no page is loaded in the frame.
///
/// Overall page ids pack a 16-bit segment id and a 48-bit page number, so
/// `u64::MAX` never names a real page.
const NO_PAGE: u64 = u64::MAX;

/// A frame in the buffer pool.
///
/// Holds the page bytes plus the metadata the pool needs: the resident page
/// id, a pin count, a dirty bit, and a reference bit for clock eviction.
pub struct Frame {
    /// The page currently stored in this frame (`NO_PAGE` = empty).
    page_id: AtomicU64,
    /// Page data, `page_size` bytes.
    data: RwLock<Box<[u8]>>,
    /// Number of fix_page brackets currently open on this page.
    pin_count: AtomicU32,
    /// Whether the page has been modified since it was last written back.
    dirty: AtomicBool,
    /// Second-chance bit for the clock replacer.
    reference_bit: AtomicBool,
}

impl Frame {
    /// Creates a new empty frame of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_id: AtomicU64::new(NO_PAGE),
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            reference_bit: AtomicBool::new(false),
        }
    }

    /// Returns the page id resident in this frame, if any.
    #[inline]
    pub fn page_id(&self) -> Option<u64> {
        let id = self.page_id.load(Ordering::Acquire);
        (id != NO_PAGE).then_some(id)
    }

    /// Sets or clears the resident page id.
    #[inline]
    pub fn set_page_id(&self, page_id: Option<u64>) {
        self.page_id
            .store(page_id.unwrap_or(NO_PAGE), Ordering::Release);
    }

    /// Increments the pin count and returns the previous value.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the pin count and returns the new value. Saturates at zero.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            self.pin_count.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Returns true if any fix bracket is open on this frame.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    /// Returns true if the page has unwritten modifications.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Sets or clears the dirty bit.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Returns the clock reference bit.
    #[inline]
    pub fn reference_bit(&self) -> bool {
        self.reference_bit.load(Ordering::Relaxed)
    }

    /// Sets the clock reference bit.
    #[inline]
    pub fn set_reference_bit(&self, value: bool) {
        self.reference_bit.store(value, Ordering::Relaxed);
    }

    /// Returns a read guard over the page bytes.
    #[inline]
    pub fn read_data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Returns a write guard over the page bytes.
    #[inline]
    pub fn write_data(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Resets the frame to its empty state, zeroing the page bytes.
    pub fn reset(&self) {
        self.page_id.store(NO_PAGE, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.reference_bit.store(false, Ordering::Relaxed);
        self.data.write().fill(0);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("page_id", &self.page_id())
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_starts_empty() {
        let frame = Frame::new(64);
        assert!(frame.page_id().is_none());
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert!(!frame.reference_bit());
        assert_eq!(frame.read_data().len(), 64);
    }

    #[test]
    fn test_frame_pin_unpin() {
        let frame = Frame::new(64);

        assert_eq!(frame.pin(), 0);
        assert_eq!(frame.pin(), 1);
        assert_eq!(frame.pin_count(), 2);
        assert!(frame.is_pinned());

        assert_eq!(frame.unpin(), 1);
        assert_eq!(frame.unpin(), 0);
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_frame_unpin_saturates() {
        let frame = Frame::new(64);
        assert_eq!(frame.unpin(), 0);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_frame_page_id_roundtrip() {
        let frame = Frame::new(64);

        frame.set_page_id(Some(42));
        assert_eq!(frame.page_id(), Some(42));

        frame.set_page_id(None);
        assert!(frame.page_id().is_none());
    }

    #[test]
    fn test_frame_data_access() {
        let frame = Frame::new(64);

        frame.write_data()[0] = 0xAB;
        assert_eq!(frame.read_data()[0], 0xAB);
    }

    #[test]
    fn test_frame_reset_clears_everything() {
        let frame = Frame::new(64);
        frame.set_page_id(Some(7));
        frame.pin();
        frame.set_dirty(true);
        frame.set_reference_bit(true);
        frame.write_data()[10] = 0xFF;

        frame.reset();

        assert!(frame.page_id().is_none());
        assert_eq!(frame.pin_count(), 0);
        assert!(!frame.is_dirty());
        assert!(!frame.reference_bit());
        assert_eq!(frame.read_data()[10], 0);
    }
}
