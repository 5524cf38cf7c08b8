//! Storage layer for the persistent log
//!
//! - `MemoryLog`: Fast, in-memory log for testing
//! - `FileLog`: File-based log with CRC32 checksums

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileLog;
pub use memory::MemoryLog;
pub use traits::{LogMetadata, LogStore, StorageError};
