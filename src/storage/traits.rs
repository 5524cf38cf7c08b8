//! Persistent log abstraction.
//!
//! The consensus core requires its log entries and a small metadata record
//! (current term, vote) to be on stable storage before it responds to any
//! RPC that depends on them.

use serde::{Deserialize, Serialize};

use crate::core::message::Entry;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(String),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// The durable scalar state kept alongside the log.
///
/// Both fields use 0 as "none". They must reach stable storage before any
/// externally visible effect that depends on them (granting a vote, sending
/// an RPC that reveals a new term, acknowledging an append).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub current_term: u64,
    pub voted_for: u64,
}

/// Durable, ordered sequence of entries plus the metadata record.
///
/// Implementations must not report success from `append`, `truncate`, or
/// `update_metadata` until the data would survive a crash; recovery must
/// yield a prefix of what was acknowledged. Any I/O failure is fatal to the
/// process, so callers treat errors from the mutating operations as
/// unrecoverable.
pub trait LogStore: Send {
    /// Append an entry, assigning it the next id. The caller-supplied id is
    /// ignored. Returns the assigned id once the entry is durable.
    fn append(&mut self, entry: Entry) -> Result<u64, StorageError>;

    /// Id of the most recent entry, or 0 if the log is empty.
    fn last_id(&self) -> u64;

    /// Look up an entry. `id` must be in `[1, last_id()]`.
    fn entry(&self, id: u64) -> &Entry;

    /// Term of the entry at `id`, or 0 if `id` is 0 or past the end.
    fn term(&self, id: u64) -> u64;

    /// Lowest id whose term equals the last entry's term; 0 if empty. Lets a
    /// new leader detect when an entry of its own term has committed.
    fn begin_last_term_id(&self) -> u64;

    /// Delete all entries with id greater than `last_kept_id`. Truncating at
    /// or past `last_id()` is a no-op.
    fn truncate(&mut self, last_kept_id: u64) -> Result<(), StorageError>;

    /// The metadata record as last written (or default on a fresh log).
    fn metadata(&self) -> &LogMetadata;

    /// Durably replace the metadata record.
    fn update_metadata(&mut self, meta: LogMetadata) -> Result<(), StorageError>;
}
