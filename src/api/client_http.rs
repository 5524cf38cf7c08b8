//! HTTP client API for a consensus server
//!
//! Thin facade over [`ReplicatedLog`] for external clients:
//! - Submit an opaque payload to the replicated log
//! - Query server status, leader hints, and the cluster configuration
//! - Drive a membership change

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::consensus::{ReplicatedLog, Role};
use crate::core::message::{ClientError, ServerAddress, SetConfigurationError};

/// Request body for submitting a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// The payload to append, as a UTF-8 string.
    pub payload: String,
}

/// Response from a successful submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Log id the payload was committed at.
    pub entry_id: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Leader hint (server id) if known, for redirect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<u64>,
}

/// Response for leader query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader_id: Option<u64>,
    pub server_id: u64,
    pub is_leader: bool,
}

/// Response for status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub server_id: u64,
    pub role: String,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub committed_id: u64,
    pub last_log_id: u64,
    pub configuration_id: u64,
}

/// Response for configuration query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationResponse {
    pub id: u64,
    pub servers: Vec<ServerAddress>,
}

/// Request body for a membership change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConfigurationRequest {
    /// Configuration id previously returned by GET /client/configuration.
    pub old_id: u64,
    pub new_servers: Vec<ServerAddress>,
}

/// Create an axum router for the client HTTP API
pub fn create_client_router(log: Arc<ReplicatedLog>) -> Router {
    Router::new()
        .route("/client/submit", post(handle_submit))
        .route("/client/leader", get(handle_leader))
        .route("/client/status", get(handle_status))
        .route(
            "/client/configuration",
            get(handle_get_configuration).post(handle_set_configuration),
        )
        .with_state(log)
}

fn client_error_response(error: ClientError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, leader_hint) = match &error {
        ClientError::NotLeader { leader_hint } => (StatusCode::SERVICE_UNAVAILABLE, *leader_hint),
        ClientError::Retry => (StatusCode::SERVICE_UNAVAILABLE, None),
        ClientError::Fail => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            leader_hint,
        }),
    )
}

/// POST /client/submit - append a payload and wait for commitment
async fn handle_submit(
    State(log): State<Arc<ReplicatedLog>>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<ErrorResponse>)> {
    match log.replicate(request.payload.into_bytes()).await {
        Ok(entry_id) => Ok(Json(SubmitResponse { entry_id })),
        Err(error) => Err(client_error_response(error)),
    }
}

/// GET /client/leader - who this server believes leads the cluster
async fn handle_leader(State(log): State<Arc<ReplicatedLog>>) -> Json<LeaderResponse> {
    let status = log.status().await;
    Json(LeaderResponse {
        leader_id: status.leader_hint,
        server_id: status.id,
        is_leader: status.role == Role::Leader,
    })
}

/// GET /client/status - introspection for operators and tests
async fn handle_status(State(log): State<Arc<ReplicatedLog>>) -> Json<StatusResponse> {
    let status = log.status().await;
    Json(StatusResponse {
        server_id: status.id,
        role: format!("{:?}", status.role),
        term: status.term,
        leader_id: status.leader_hint,
        committed_id: status.committed_id,
        last_log_id: status.last_log_id,
        configuration_id: status.configuration_id,
    })
}

/// GET /client/configuration - the committed stable configuration
async fn handle_get_configuration(
    State(log): State<Arc<ReplicatedLog>>,
) -> Result<Json<ConfigurationResponse>, (StatusCode, Json<ErrorResponse>)> {
    match log.get_configuration().await {
        Ok((id, servers)) => Ok(Json(ConfigurationResponse { id, servers })),
        Err(error) => Err(client_error_response(error)),
    }
}

/// POST /client/configuration - run a membership change
async fn handle_set_configuration(
    State(log): State<Arc<ReplicatedLog>>,
    Json(request): Json<SetConfigurationRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    match log.set_configuration(request.old_id, request.new_servers).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(error) => {
            let (status, leader_hint) = match &error {
                SetConfigurationError::NotLeader { leader_hint } => {
                    (StatusCode::SERVICE_UNAVAILABLE, *leader_hint)
                }
                SetConfigurationError::Changed { .. } => (StatusCode::CONFLICT, None),
                SetConfigurationError::Bad { .. } => (StatusCode::BAD_GATEWAY, None),
                SetConfigurationError::Retry => (StatusCode::SERVICE_UNAVAILABLE, None),
                SetConfigurationError::Fail => (StatusCode::INTERNAL_SERVER_ERROR, None),
            };
            Err((
                status,
                Json(ErrorResponse {
                    error: error.to_string(),
                    leader_hint,
                }),
            ))
        }
    }
}
