use botnet_types::AuthErrorCode;
use thiserror::Error;

/// Errors produced by handshake, credential and friendship operations.
#[derive(Debug, Error)]
pub enum FederationError {
    /// Malformed or missing input.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Unknown session id, challenge-token mismatch or riddle mismatch.
    ///
    /// Carries no detail: callers learn nothing about which part of a
    /// handshake submission was wrong.
    #[error("invalid or expired handshake session")]
    InvalidSession,

    /// The session (or friendship) is not in a state that allows this step.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    /// The peer is blocked or otherwise not allowed to perform the action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("authentication failed: {0}")]
    Auth(AuthErrorCode),

    /// A message signature is missing, malformed, stale or does not match
    /// the author's public key.
    #[error("signature rejected: {0}")]
    InvalidSignature(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}
