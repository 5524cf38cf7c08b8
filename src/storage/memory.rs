//! In-memory log implementation for testing
//!
//! Implements the `LogStore` interface without any durability. Useful for
//! unit tests and in-process clusters where persistence is not needed.

use crate::core::message::Entry;

use super::{LogMetadata, LogStore, StorageError};

/// Volatile log store; index `i` of the vec holds entry id `i + 1`.
#[derive(Default)]
pub struct MemoryLog {
    entries: Vec<Entry>,
    metadata: LogMetadata,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLog {
    fn append(&mut self, mut entry: Entry) -> Result<u64, StorageError> {
        let id = self.entries.len() as u64 + 1;
        entry.id = id;
        self.entries.push(entry);
        Ok(id)
    }

    fn last_id(&self) -> u64 {
        self.entries.len() as u64
    }

    fn entry(&self, id: u64) -> &Entry {
        &self.entries[(id - 1) as usize]
    }

    fn term(&self, id: u64) -> u64 {
        if id == 0 || id > self.last_id() {
            0
        } else {
            self.entries[(id - 1) as usize].term
        }
    }

    fn begin_last_term_id(&self) -> u64 {
        let last_term = match self.entries.last() {
            Some(e) => e.term,
            None => return 0,
        };
        let mut begin = self.last_id();
        while begin > 1 && self.entries[(begin - 2) as usize].term == last_term {
            begin -= 1;
        }
        begin
    }

    fn truncate(&mut self, last_kept_id: u64) -> Result<(), StorageError> {
        if last_kept_id < self.last_id() {
            self.entries.truncate(last_kept_id as usize);
        }
        Ok(())
    }

    fn metadata(&self) -> &LogMetadata {
        &self.metadata
    }

    fn update_metadata(&mut self, meta: LogMetadata) -> Result<(), StorageError> {
        self.metadata = meta;
        Ok(())
    }
}
