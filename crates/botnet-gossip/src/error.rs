use botnet_federation::FederationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// The source identifier classifies as neither local nor federated.
    #[error("invalid source domain: {0}")]
    InvalidDomain(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl From<FederationError> for GossipError {
    fn from(err: FederationError) -> Self {
        match err {
            FederationError::Database(e) => GossipError::Database(e),
            other => GossipError::Validation(other.to_string()),
        }
    }
}
