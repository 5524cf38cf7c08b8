//! Log entries, configuration descriptors, and RPC message types.

use serde::{Deserialize, Serialize};

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Opaque client payload, handed to the consumer of the committed stream.
    Data,
    /// A membership descriptor; installed by the core itself.
    Configuration,
}

/// A single replicated log entry.
///
/// Entry ids are assigned by the log on append, starting at 1; id 0 is the
/// reserved "none" value. Once persisted, an entry never changes unless the
/// tail of the log is truncated by a new leader's conflicting entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry id (1-based, 0 = none).
    pub id: u64,
    /// Term in which the entry was created by a leader.
    pub term: u64,
    /// What the entry carries.
    pub kind: EntryType,
    /// Opaque payload; meaningful only for `Data` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    /// Membership descriptor; present only for `Configuration` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ConfigurationDescriptor>,
}

impl Entry {
    /// A data entry awaiting id assignment by the log.
    pub fn data(term: u64, payload: Vec<u8>) -> Self {
        Entry {
            id: 0,
            term,
            kind: EntryType::Data,
            payload,
            configuration: None,
        }
    }

    /// A configuration entry awaiting id assignment by the log.
    pub fn configuration(term: u64, descriptor: ConfigurationDescriptor) -> Self {
        Entry {
            id: 0,
            term,
            kind: EntryType::Configuration,
            payload: Vec::new(),
            configuration: Some(descriptor),
        }
    }
}

/// A server id paired with the network address it can be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    /// Nonzero server id.
    pub id: u64,
    /// Transport address, e.g. `127.0.0.1:8001`.
    pub address: String,
}

/// The membership view carried by a `Configuration` entry.
///
/// An empty `new_servers` list means a simple (stable) configuration over
/// `old_servers`; a non-empty one means a transitional (joint consensus)
/// configuration requiring majorities of both lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    pub old_servers: Vec<ServerAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_servers: Vec<ServerAddress>,
}

impl ConfigurationDescriptor {
    /// A stable descriptor over a single server list.
    pub fn stable(servers: Vec<ServerAddress>) -> Self {
        ConfigurationDescriptor {
            old_servers: servers,
            new_servers: Vec::new(),
        }
    }

    /// A transitional descriptor joining an old and a new server list.
    pub fn transitional(old: Vec<ServerAddress>, new: Vec<ServerAddress>) -> Self {
        ConfigurationDescriptor {
            old_servers: old,
            new_servers: new,
        }
    }

    /// True if this descriptor carries only a single server list.
    pub fn is_stable(&self) -> bool {
        self.new_servers.is_empty()
    }
}

/// RequestVote RPC request, sent by candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: u64,
    /// Candidate requesting the vote.
    pub candidate_id: u64,
    /// Id of the candidate's last log entry.
    pub last_log_id: u64,
    /// Term of the candidate's last log entry.
    pub last_log_term: u64,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Responder's current term, for the candidate to update itself.
    pub term: u64,
    /// True if the responder granted its vote.
    pub granted: bool,
    /// Responder's last log id, letting new leaders size up followers.
    pub last_log_id: u64,
}

/// AppendEntry RPC request: replication traffic or an empty heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntryRequest {
    /// Leader's term.
    pub term: u64,
    /// Leader's id, recorded by followers for client redirection.
    pub leader_id: u64,
    /// Id of the entry immediately preceding `entries`.
    pub prev_log_id: u64,
    /// Term of the entry at `prev_log_id`.
    pub prev_log_term: u64,
    /// Entries to store; empty for a heartbeat.
    pub entries: Vec<Entry>,
    /// Leader's commit id.
    pub leader_commit_id: u64,
}

/// AppendEntry RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntryResponse {
    /// Responder's current term.
    pub term: u64,
    /// True if the follower matched `prev_log_*` and stored the entries.
    pub success: bool,
    /// Responder's last log id; on rejection this is the hint a leader may
    /// use to skip backward past a hole instead of probing one id at a time.
    pub last_log_id: u64,
}

/// Outcome of a client-facing operation on the consensus core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// This server is not the leader; retry against `leader_hint` if set.
    #[error("not the leader")]
    NotLeader {
        /// Last known leader id, if any.
        leader_hint: Option<u64>,
    },
    /// Transient condition (election in progress, lease lost mid-flight);
    /// retrying the same operation is safe.
    #[error("transient failure, retry")]
    Retry,
    /// This attempt failed permanently (e.g. the server is exiting).
    #[error("request failed")]
    Fail,
}

/// Outcome of `set_configuration`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetConfigurationError {
    /// The supplied configuration id no longer matches the committed stable
    /// configuration; the membership changed underneath the caller.
    #[error("configuration changed since id {current}")]
    Changed { current: u64 },
    /// One or more new servers failed to catch up in time.
    #[error("servers failed to catch up: {servers:?}")]
    Bad { servers: Vec<u64> },
    /// This server is not the leader.
    #[error("not the leader")]
    NotLeader { leader_hint: Option<u64> },
    /// Leadership or the term changed mid-change; retrying is safe.
    #[error("transient failure, retry")]
    Retry,
    /// The server is exiting.
    #[error("request failed")]
    Fail,
}
