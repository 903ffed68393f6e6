//! Buffer management for QuarryDB.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable page size and frame count
//! - Clock eviction policy for cache management
//! - Pin counting via explicit fix/unfix brackets
//! - Dirty page tracking with write-back to per-segment files
//! - Crash simulation via `discard_all_pages`

mod frame;
mod manager;
mod replacer;

pub use frame::Frame;
pub use manager::{BufferFrame, BufferManager};
pub use replacer::ClockReplacer;
