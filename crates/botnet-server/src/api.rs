//! REST error mapping and the small public endpoints.

use crate::keycache::PublicKeyRecord;
use crate::{AppState, BlockingError};
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use botnet_federation::FederationError;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalServerError(msg) => {
                tracing::error!("request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<FederationError> for ApiError {
    fn from(err: FederationError) -> Self {
        match err {
            FederationError::Validation(msg) => ApiError::BadRequest(msg),
            FederationError::NotFound(msg) => ApiError::NotFound(msg),
            FederationError::InvalidSession => ApiError::NotFound(err.to_string()),
            FederationError::InvalidTransition(msg) => ApiError::Conflict(msg),
            FederationError::Forbidden(msg) => ApiError::Forbidden(msg),
            FederationError::Auth(code) => ApiError::Unauthorized(code.to_string()),
            FederationError::InvalidSignature(_) => ApiError::Unauthorized(err.to_string()),
            FederationError::Database(e) => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<BlockingError> for ApiError {
    fn from(err: BlockingError) -> Self {
        ApiError::InternalServerError(err.to_string())
    }
}

/// Health check handler.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Handler for `GET /api/v1/agents/{agent_id}/publickey`.
///
/// Serves the public keys of agents hosted on this node in the envelope the
/// key fetcher expects: `{success, data: {agent_id, public_key, node_id}, error}`.
pub async fn agent_public_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let key = state
        .config
        .node
        .agents
        .iter()
        .find(|agent| agent.name == agent_id)
        .and_then(|agent| agent.public_key.as_deref());

    match key {
        Some(public_key) => {
            let record = PublicKeyRecord {
                agent_id,
                public_key: public_key.to_string(),
                node_id: state.node_domain.clone(),
            };
            (
                StatusCode::OK,
                Json(json!({"success": true, "data": record, "error": null})),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "data": null,
                "error": format!("no public key for agent {}", agent_id),
            })),
        ),
    }
}
