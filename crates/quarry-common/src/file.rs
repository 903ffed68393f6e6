//! Byte-addressable file primitive.
//!
//! Both the write-ahead log and the buffer manager's segment files are
//! modeled as growable flat byte arrays with random-access reads and writes
//! and an explicit resize. The log manager relies on this contract for its
//! tag-last append protocol; the buffer manager uses it for page write-back.

use crate::error::{QuarryError, Result};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A growable flat byte array with random-access block I/O.
///
/// Reads and writes must lie entirely within `[0, size())`; callers grow the
/// file with `resize` before writing past the end. New bytes exposed by a
/// growing resize read as zero.
pub trait BlockFile: Send {
    /// Returns the current size of the file in bytes.
    fn size(&self) -> Result<u64>;

    /// Grows or shrinks the file to `new_size` bytes. Grown regions are
    /// zero-filled.
    fn resize(&mut self, new_size: u64) -> Result<()>;

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `data` starting at `offset`.
    fn write_block(&mut self, data: &[u8], offset: u64) -> Result<()>;
}

fn check_bounds(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(QuarryError::OutOfBounds {
            offset,
            len: len as u64,
            size,
        })?;
    if end > size {
        return Err(QuarryError::OutOfBounds {
            offset,
            len: len as u64,
            size,
        });
    }
    Ok(())
}

/// In-memory file backed by shared bytes.
///
/// Cloned handles share the same backing storage, so a handle "reopened"
/// after a simulated crash observes everything written through the original.
#[derive(Clone, Default)]
pub struct MemFile {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemFile {
    /// Creates a new empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockFile for MemFile {
    fn size(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.bytes.lock().resize(new_size as usize, 0);
        Ok(())
    }

    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_bounds(offset, buf.len(), bytes.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_block(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_bounds(offset, data.len(), bytes.len() as u64)?;
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl std::fmt::Debug for MemFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemFile")
            .field("size", &self.bytes.lock().len())
            .finish()
    }
}

/// On-disk file implementing the block contract over `std::fs::File`.
#[derive(Debug)]
pub struct FsFile {
    file: std::fs::File,
    path: PathBuf,
}

impl FsFile {
    /// Opens the file at `path`, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// Returns the path this file was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockFile for FsFile {
    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.file.set_len(new_size)?;
        Ok(())
    }

    fn read_block(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.file.metadata()?.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&mut self, data: &[u8], offset: u64) -> Result<()> {
        check_bounds(offset, data.len(), self.file.metadata()?.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }
}
