//! Error types for QuarryDB.

use thiserror::Error;

/// Result type alias using QuarryError.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Errors that can occur in QuarryDB operations.
#[derive(Debug, Error)]
pub enum QuarryError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file access out of bounds: offset {offset}, len {len}, file size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    // Buffer manager errors
    #[error("buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    // Heap segment errors
    #[error("tuple not found: {tid}")]
    TupleNotFound { tid: u64 },

    #[error("tuple too large: {size} bytes (slot holds {max})")]
    TupleTooLarge { size: usize, max: usize },

    // WAL errors
    #[error("WAL corrupted at offset {offset}: {reason}")]
    WalCorrupted { offset: u64, reason: String },

    // Configuration errors
    #[error("invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },
}
