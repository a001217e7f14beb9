//! Authenticated calls to friends.
//!
//! The permanent credential a peer issued to this node is exchanged for a
//! session token on first use; the session token is cached in
//! `peer_credentials` and replaced once the peer rejects it.

use crate::remote::RemoteError;
use crate::{run_blocking, AppState, BlockingError};
use botnet_federation::peer;
use botnet_types::CredentialTier;
use serde_json::{json, Value};

impl From<BlockingError> for RemoteError {
    fn from(err: BlockingError) -> Self {
        RemoteError::Storage(err.to_string())
    }
}

async fn stored_credentials(
    state: &AppState,
    peer_domain: &str,
) -> Result<(Option<String>, Option<String>), RemoteError> {
    let peer_domain = peer_domain.to_string();
    run_blocking(&state.pool, move |conn| -> Result<_, RemoteError> {
        let read = |tier| {
            peer::get_peer_credential(conn, &peer_domain, tier)
                .map(|c| c.map(|c| c.token))
                .map_err(|e| RemoteError::Storage(e.to_string()))
        };
        Ok((read(CredentialTier::Session)?, read(CredentialTier::Permanent)?))
    })
    .await
}

async fn forget_session(state: &AppState, peer_domain: &str) -> Result<(), RemoteError> {
    let peer_domain = peer_domain.to_string();
    run_blocking(&state.pool, move |conn| -> Result<_, RemoteError> {
        peer::delete_peer_credential(conn, &peer_domain, CredentialTier::Session)
            .map_err(|e| RemoteError::Storage(e.to_string()))?;
        Ok(())
    })
    .await
}

/// Logs in to `peer_domain` with the permanent credential and stores the
/// session token it returns.
pub async fn login(
    state: &AppState,
    peer_domain: &str,
    permanent: Option<&str>,
) -> Result<String, RemoteError> {
    let permanent = permanent.ok_or_else(|| RemoteError::NoCredential(peer_domain.to_string()))?;
    let result = state
        .remote
        .call(
            peer_domain,
            "login",
            json!({ "domain": state.node_domain, "credential": permanent }),
            None,
        )
        .await?;

    let token = result
        .get("session_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RemoteError::Decode("login response has no session_token".into()))?
        .to_string();
    let expires_at = result.get("expires_at").and_then(Value::as_i64);

    let stored = token.clone();
    let peer_owned = peer_domain.to_string();
    run_blocking(&state.pool, move |conn| -> Result<_, RemoteError> {
        peer::store_peer_credential(conn, &peer_owned, CredentialTier::Session, &stored, expires_at)
            .map_err(|e| RemoteError::Storage(e.to_string()))
    })
    .await?;

    tracing::info!(peer = %peer_domain, "logged in to peer");
    Ok(token)
}

/// Calls `method` on a friend with a session token, logging in when no
/// session is held and once more when the peer rejects the cached one.
pub async fn call_with_session(
    state: &AppState,
    peer_domain: &str,
    method: &str,
    params: Value,
) -> Result<Value, RemoteError> {
    let (session, permanent) = stored_credentials(state, peer_domain).await?;
    let (token, fresh) = match session {
        Some(token) => (token, false),
        None => (login(state, peer_domain, permanent.as_deref()).await?, true),
    };

    match state
        .remote
        .call(peer_domain, method, params.clone(), Some(&token))
        .await
    {
        Err(e) if !fresh && e.auth_error_code().is_some() => {
            tracing::info!(peer = %peer_domain, method, "cached session rejected, logging in again");
            forget_session(state, peer_domain).await?;
            let token = login(state, peer_domain, permanent.as_deref()).await?;
            state
                .remote
                .call(peer_domain, method, params, Some(&token))
                .await
        }
        other => other,
    }
}
