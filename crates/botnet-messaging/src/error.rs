use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A message with this id already exists; nothing was written.
    #[error("duplicate message id: {0}")]
    DuplicateMessage(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}
