//! Configuration structures for QuarryDB.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default page size in bytes (16 KB).
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Storage configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for segment files and the log file.
    pub data_dir: PathBuf,
    /// File name of the write-ahead log within `data_dir`.
    pub log_file_name: String,
    /// Page size in bytes.
    pub page_size: usize,
    /// Buffer pool size in number of frames.
    pub buffer_frames: usize,
}

impl StorageConfig {
    /// Returns the full path of the write-ahead log file.
    pub fn log_file_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_file_name)
    }

    /// Returns a configuration rooted at the given directory, keeping the
    /// default sizing.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_file_name: "quarry.wal".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            buffer_frames: 1024,
        }
    }
}
