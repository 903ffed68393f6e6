//! Clock (second-chance) eviction policy.

use crate::frame::Frame;
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Clock replacement over frame indexes.
///
/// Tracks which frames are evictable (unpinned); the reference bits live on
/// the frames themselves and give each candidate a second chance before it
/// is picked as a victim.
pub struct ClockReplacer {
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    capacity: usize,
    evictable: BTreeSet<usize>,
    hand: usize,
}

impl ClockReplacer {
    /// Creates a replacer for a pool of `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                capacity,
                evictable: BTreeSet::new(),
                hand: 0,
            }),
        }
    }

    /// Marks the frame at `idx` as evictable or not.
    pub fn set_evictable(&self, idx: usize, evictable: bool) {
        let mut inner = self.inner.lock();
        if idx >= inner.capacity {
            return;
        }
        if evictable {
            inner.evictable.insert(idx);
        } else {
            inner.evictable.remove(&idx);
        }
    }

    /// Selects a victim frame, sweeping the clock hand over the evictable
    /// set and clearing reference bits as it passes.
    ///
    /// Returns `None` when no frame is evictable.
    pub fn evict(&self, frames: &[Frame]) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.evictable.is_empty() {
            return None;
        }

        // Two full sweeps: the first clears every reference bit, the second
        // must therefore find a victim.
        for _ in 0..2 * inner.capacity {
            let hand = inner.hand;
            inner.hand = (hand + 1) % inner.capacity;

            if !inner.evictable.contains(&hand) {
                continue;
            }
            if frames[hand].reference_bit() {
                frames[hand].set_reference_bit(false);
            } else {
                inner.evictable.remove(&hand);
                return Some(hand);
            }
        }

        let idx = *inner.evictable.iter().next()?;
        inner.evictable.remove(&idx);
        Some(idx)
    }

    /// Returns the number of evictable frames.
    pub fn evictable_count(&self) -> usize {
        self.inner.lock().evictable.len()
    }

    /// Forgets all evictable frames and rewinds the clock hand.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.evictable.clear();
        inner.hand = 0;
    }
}
