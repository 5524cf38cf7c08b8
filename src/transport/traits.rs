//! Transport abstraction for consensus RPC communication

use async_trait::async_trait;

use crate::core::message::{
    AppendEntryRequest, AppendEntryResponse, RequestVoteRequest, RequestVoteResponse,
};

/// Transport abstraction for consensus RPC communication.
///
/// Peers are addressed by the address string carried in the cluster
/// configuration, so a membership change can move a server without touching
/// the transport. Implementations are expected to bound each call (timeouts
/// count as [`TransportError::Timeout`]) so callers always make progress.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to the server at `address`.
    async fn request_vote(
        &self,
        address: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    /// Send an AppendEntry RPC (entries or heartbeat) to the server at
    /// `address`.
    async fn append_entry(
        &self,
        address: &str,
        request: AppendEntryRequest,
    ) -> Result<AppendEntryResponse, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection to the target address failed
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// No server is reachable at the target address
    #[error("no such node")]
    NodeNotFound,
}
