//! The consensus engine: messages, membership, timing, and the monitor.

pub mod config;
pub mod consensus;
pub mod membership;
pub mod message;

pub use config::RaftOptions;
pub use consensus::{bootstrap, ReplicatedLog, Role, StatusSnapshot};
pub use message::{ClientError, ConfigurationDescriptor, Entry, EntryType, ServerAddress, SetConfigurationError};
