//! Buffer manager.

use crate::frame::Frame;
use crate::replacer::ClockReplacer;
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use quarry_common::{BlockFile, FsFile, QuarryError, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use sysinfo::System;
use tracing::{debug, trace};

/// Number of bits of an overall page id used for the segment-local page
/// number; the remaining high bits carry the segment id.
const SEGMENT_PAGE_BITS: u32 = 48;

/// A pinned page handle returned by [`BufferManager::fix_page`].
///
/// Gives byte-level access to the page contents. The handle must be returned
/// through [`BufferManager::unfix_page`], which releases the pin and records
/// whether the page was modified.
pub struct BufferFrame<'a> {
    frame: &'a Frame,
    idx: usize,
    page_id: u64,
}

impl BufferFrame<'_> {
    /// Returns the overall page id this handle is fixed on.
    pub fn page_id(&self) -> u64 {
        self.page_id
    }

    /// Returns a read guard over the page bytes.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.read_data()
    }

    /// Returns a write guard over the page bytes.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.frame.write_data()
    }
}

/// Buffer manager: a fixed pool of page frames over per-segment files.
///
/// Pages are addressed by an overall page id that packs the segment id into
/// the high 16 bits. Each segment is backed by one file in the manager's
/// directory, written lazily: a page only reaches its file through
/// `flush_page`/`flush_all_pages` or when a dirty frame is evicted.
pub struct BufferManager {
    page_size: usize,
    frames: Vec<Frame>,
    page_table: Mutex<HashMap<u64, usize>>,
    free_list: Mutex<Vec<usize>>,
    replacer: ClockReplacer,
    files: Mutex<HashMap<u64, FsFile>>,
    dir: PathBuf,
}

impl BufferManager {
    /// Creates a buffer manager with `frame_count` frames of `page_size`
    /// bytes each, persisting segments under `dir`.
    pub fn new(page_size: usize, frame_count: usize, dir: impl AsRef<Path>) -> Result<Self> {
        if page_size == 0 {
            return Err(QuarryError::InvalidParameter {
                name: "page_size".to_string(),
                value: page_size.to_string(),
            });
        }
        if frame_count == 0 {
            return Err(QuarryError::InvalidParameter {
                name: "frame_count".to_string(),
                value: frame_count.to_string(),
            });
        }
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let frames = (0..frame_count).map(|_| Frame::new(page_size)).collect();
        Ok(Self {
            page_size,
            frames,
            page_table: Mutex::new(HashMap::new()),
            free_list: Mutex::new((0..frame_count).collect()),
            replacer: ClockReplacer::new(frame_count),
            files: Mutex::new(HashMap::new()),
            dir,
        })
    }

    /// Creates a buffer manager sized to 25% of available system RAM,
    /// with a floor of 1,000 frames.
    pub fn auto_sized(page_size: usize, dir: impl AsRef<Path>) -> Result<Self> {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let target_bytes = sys.available_memory() as usize / 4;
        let frame_count = (target_bytes / page_size.max(1)).max(1_000);
        Self::new(page_size, frame_count, dir)
    }

    /// Packs a segment id and a segment-local page number into an overall
    /// page id.
    pub fn overall_page_id(segment_id: u64, segment_page_id: u64) -> u64 {
        (segment_id << SEGMENT_PAGE_BITS) | segment_page_id
    }

    /// Extracts the segment id from an overall page id.
    pub fn segment_id(page_id: u64) -> u64 {
        page_id >> SEGMENT_PAGE_BITS
    }

    /// Extracts the segment-local page number from an overall page id.
    pub fn segment_page_id(page_id: u64) -> u64 {
        page_id & ((1u64 << SEGMENT_PAGE_BITS) - 1)
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of frames in the pool.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Pins the page in a frame and returns a handle to its bytes.
    ///
    /// Loads the page from its segment file if it is not resident (pages the
    /// file does not cover yet read as zeros), evicting an unpinned victim
    /// when the pool is full. `exclusive` is advisory under the single-writer
    /// model. Errors with `BufferPoolFull` when every frame is pinned.
    pub fn fix_page(&self, page_id: u64, _exclusive: bool) -> Result<BufferFrame<'_>> {
        let mut table = self.page_table.lock();

        if let Some(&idx) = table.get(&page_id) {
            let frame = &self.frames[idx];
            if frame.pin() == 0 {
                self.replacer.set_evictable(idx, false);
            }
            frame.set_reference_bit(true);
            return Ok(BufferFrame {
                frame,
                idx,
                page_id,
            });
        }

        let idx = self.allocate_frame(&mut table)?;
        let frame = &self.frames[idx];
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.pin();
        frame.set_reference_bit(true);
        self.load_page(page_id, frame)?;
        table.insert(page_id, idx);

        Ok(BufferFrame {
            frame,
            idx,
            page_id,
        })
    }

    /// Releases the pin taken by `fix_page`. `is_dirty` marks the page for
    /// eventual write-back.
    pub fn unfix_page(&self, frame: BufferFrame<'_>, is_dirty: bool) {
        if is_dirty {
            frame.frame.set_dirty(true);
        }
        if frame.frame.unpin() == 0 {
            self.replacer.set_evictable(frame.idx, true);
        }
    }

    /// Synchronously writes the page to its segment file if it is resident
    /// and dirty. Clean or non-resident pages are a no-op.
    pub fn flush_page(&self, page_id: u64) -> Result<()> {
        let table = self.page_table.lock();
        if let Some(&idx) = table.get(&page_id) {
            let frame = &self.frames[idx];
            if frame.is_dirty() {
                let data = frame.read_data();
                self.write_back(page_id, &data)?;
                drop(data);
                frame.set_dirty(false);
                trace!(page_id, "flushed page");
            }
        }
        Ok(())
    }

    /// Synchronously writes every dirty resident page to its segment file.
    pub fn flush_all_pages(&self) -> Result<()> {
        let table = self.page_table.lock();
        let mut resident: Vec<(u64, usize)> = table.iter().map(|(&p, &i)| (p, i)).collect();
        drop(table);
        resident.sort_unstable();

        for (page_id, idx) in resident {
            let frame = &self.frames[idx];
            if frame.is_dirty() {
                let data = frame.read_data();
                self.write_back(page_id, &data)?;
                drop(data);
                frame.set_dirty(false);
            }
        }
        Ok(())
    }

    /// Returns a sorted snapshot of the dirty resident page ids.
    pub fn get_dirty_page_ids(&self) -> Vec<u64> {
        let table = self.page_table.lock();
        let mut dirty: Vec<u64> = table
            .iter()
            .filter(|&(_, &idx)| self.frames[idx].is_dirty())
            .map(|(&page_id, _)| page_id)
            .collect();
        dirty.sort_unstable();
        dirty
    }

    /// Drops all buffer contents without flushing.
    ///
    /// Used by the crash simulator: everything that was not written back is
    /// lost, and the pool returns to its freshly-constructed state. Segment
    /// files are untouched.
    pub fn discard_all_pages(&self) {
        let mut table = self.page_table.lock();
        table.clear();
        for frame in &self.frames {
            frame.reset();
        }
        *self.free_list.lock() = (0..self.frames.len()).collect();
        self.replacer.reset();
        debug!("discarded all buffered pages");
    }

    /// Picks a frame for a new page: a free frame if one exists, otherwise
    /// an evicted victim (written back first when dirty).
    fn allocate_frame(&self, table: &mut HashMap<u64, usize>) -> Result<usize> {
        if let Some(idx) = self.free_list.lock().pop() {
            return Ok(idx);
        }

        let idx = self
            .replacer
            .evict(&self.frames)
            .ok_or(QuarryError::BufferPoolFull)?;
        let frame = &self.frames[idx];

        if let Some(old_page_id) = frame.page_id() {
            if frame.is_dirty() {
                let data = frame.read_data();
                self.write_back(old_page_id, &data)?;
                debug!(page_id = old_page_id, "evicted dirty page");
            }
            table.remove(&old_page_id);
        }
        Ok(idx)
    }

    /// Reads a page's bytes from its segment file into the frame. Pages the
    /// file does not cover yet are left zeroed.
    fn load_page(&self, page_id: u64, frame: &Frame) -> Result<()> {
        let offset = Self::segment_page_id(page_id) * self.page_size as u64;
        let mut files = self.files.lock();
        let file = self.segment_file(&mut files, Self::segment_id(page_id))?;

        if file.size()? >= offset + self.page_size as u64 {
            let mut data = frame.write_data();
            file.read_block(offset, &mut data)?;
        }
        Ok(())
    }

    /// Writes page bytes to the owning segment file, growing it as needed.
    fn write_back(&self, page_id: u64, data: &[u8]) -> Result<()> {
        let offset = Self::segment_page_id(page_id) * self.page_size as u64;
        let mut files = self.files.lock();
        let file = self.segment_file(&mut files, Self::segment_id(page_id))?;

        let needed = offset + self.page_size as u64;
        if file.size()? < needed {
            file.resize(needed)?;
        }
        file.write_block(data, offset)
    }

    /// Returns the open file backing a segment, creating it lazily.
    fn segment_file<'a>(
        &self,
        files: &'a mut HashMap<u64, FsFile>,
        segment_id: u64,
    ) -> Result<&'a mut FsFile> {
        match files.entry(segment_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let file = FsFile::open(self.dir.join(segment_id.to_string()))?;
                Ok(entry.insert(file))
            }
        }
    }
}
