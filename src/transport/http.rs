//! HTTP/JSON transport
//!
//! Outbound: [`HttpTransport`] holds one cached `reqwest` client whose
//! pooled connections act as the peer sessions. Inbound: [`create_router`]
//! exposes the two consensus RPCs under `/raft/*` for `axum::serve`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};

use crate::core::consensus::ReplicatedLog;
use crate::core::message::{
    AppendEntryRequest, AppendEntryResponse, RequestVoteRequest, RequestVoteResponse,
};

use super::{Transport, TransportError};

/// Transport that speaks HTTP/JSON to peer servers.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport whose RPCs are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build http client");
        HttpTransport { client }
    }

    async fn post<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        address: &str,
        path: &str,
        request: &Req,
    ) -> Result<Resp, TransportError> {
        let url = format!("http://{address}{path}");
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;
        response
            .json()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        address: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        self.post(address, "/raft/request_vote", &request).await
    }

    async fn append_entry(
        &self,
        address: &str,
        request: AppendEntryRequest,
    ) -> Result<AppendEntryResponse, TransportError> {
        self.post(address, "/raft/append_entry", &request).await
    }
}

/// Router serving the peer-facing RPC endpoints.
pub fn create_router(log: Arc<ReplicatedLog>) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entry", post(handle_append_entry))
        .with_state(log)
}

async fn handle_request_vote(
    State(log): State<Arc<ReplicatedLog>>,
    Json(request): Json<RequestVoteRequest>,
) -> Json<RequestVoteResponse> {
    Json(log.handle_request_vote(request).await)
}

async fn handle_append_entry(
    State(log): State<Arc<ReplicatedLog>>,
    Json(request): Json<AppendEntryRequest>,
) -> Json<AppendEntryResponse> {
    Json(log.handle_append_entry(request).await)
}
