//! QuarryDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all QuarryDB components,
//! including the byte-addressable file primitive that backs both the
//! write-ahead log and the buffer manager's segment files.

pub mod config;
pub mod error;
pub mod file;

pub use config::StorageConfig;
pub use error::{QuarryError, Result};
pub use file::{BlockFile, FsFile, MemFile};
