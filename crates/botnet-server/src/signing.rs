//! Checks agent signatures on messages before they are stored.
//!
//! Keys of agents on this node come from configuration. Keys of agents on
//! another node are fetched from that node's key endpoint and cached.

use crate::keycache::fetch_owned_key;
use crate::rpc::RpcError;
use crate::AppState;
use botnet_federation::{signature, FederationError};
use botnet_types::time::now_millis;

/// Signature fields supplied with `message.send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSignature {
    /// Hex-encoded Ed25519 signature.
    pub signature: String,
    /// Epoch seconds.
    pub signed_at: i64,
}

impl MessageSignature {
    /// Pairs the optional request fields; one without the other is invalid.
    pub fn from_parts(
        signature: Option<String>,
        signed_at: Option<i64>,
    ) -> Result<Option<Self>, RpcError> {
        match (signature, signed_at) {
            (Some(signature), Some(signed_at)) => Ok(Some(Self {
                signature,
                signed_at,
            })),
            (None, None) => Ok(None),
            _ => Err(RpcError::invalid_params(
                "signature and signed_at must be given together",
            )),
        }
    }
}

async fn author_key(state: &AppState, author: &str, origin: &str) -> Result<String, FederationError> {
    if origin == state.node_domain {
        return state
            .config
            .node
            .agents
            .iter()
            .find(|agent| agent.name == author)
            .and_then(|agent| agent.public_key.clone())
            .ok_or_else(|| {
                FederationError::InvalidSignature(format!("no public key configured for {author}"))
            });
    }

    fetch_owned_key(&state.key_cache, &state.remote, author, origin)
        .await
        .map(|entry| entry.public_key)
        .map_err(|e| FederationError::InvalidSignature(format!("cannot verify {author}@{origin}: {e}")))
}

/// Verifies that `author`, an agent hosted on `origin`, signed `content`.
pub async fn verify_author(
    state: &AppState,
    author: &str,
    origin: &str,
    content: &str,
    signed: &MessageSignature,
) -> Result<(), RpcError> {
    let public_key = author_key(state, author, origin).await?;
    match signature::verify_message(
        &public_key,
        author,
        content,
        signed.signed_at,
        &signed.signature,
        now_millis() / 1000,
    ) {
        Ok(()) => {
            tracing::debug!(author, origin, "message signature verified");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(author, origin, "rejected message signature: {}", e);
            Err(e.into())
        }
    }
}
