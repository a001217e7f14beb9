//! Friendship, credential, riddle, key and join-client RPC methods.

use crate::keycache::{fetch_public_key, PublicKeyRecord};
use crate::remote::RemoteError;
use crate::rpc::{parse_params, CallContext, RpcError};
use crate::{run_blocking, AppState};
use botnet_federation::peer::{self, OutboundHandshake};
use botnet_federation::{friendship, riddle, token, NewRiddle};
use botnet_types::time::{now_millis, to_rfc3339};
use botnet_types::{classify_domain, CredentialTier, DomainClass, FriendshipStatus, HandshakeStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct DomainParams {
    domain: String,
}

#[derive(Debug, Deserialize)]
struct OptionalDomainParams {
    #[serde(default)]
    domain: Option<String>,
}

pub fn ping(state: &AppState) -> Value {
    json!({
        "node": state.node_domain,
        "time": to_rfc3339(now_millis()),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

pub async fn friendship_request(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let DomainParams { domain } = parse_params(params)?;
    let st = state.clone();
    let (friendship, credential) = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(friendship::request_friendship(
            conn,
            &st.handshake.lifetimes,
            &st.node_domain,
            &domain,
        )?)
    })
    .await?;

    Ok(json!({
        "status": friendship.status,
        "friendship": friendship,
        "negotiation_token": credential.token,
        "expires_at": credential.expires_at,
    }))
}

/// Reports friendship status to the holder of a negotiation token. The first
/// check after the friendship turned active also hands over the permanent
/// credential.
pub async fn friendship_status(
    state: &Arc<AppState>,
    ctx: &CallContext,
    params: Value,
) -> Result<Value, RpcError> {
    let OptionalDomainParams { domain } = parse_params(params)?;
    let st = state.clone();

    if ctx.is_local_agent() {
        let domain = domain.ok_or_else(|| RpcError::invalid_params("domain is required"))?;
        let found = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
            Ok(friendship::get_friendship(conn, &st.node_domain, &domain)?)
        })
        .await?
        .ok_or_else(|| RpcError::new(crate::rpc::NOT_FOUND, "no friendship with that domain"))?;
        return Ok(json!({
            "domain": found.peer_domain,
            "status": found.status,
            "friendship": found,
            "permanent_credential": null,
        }));
    }

    let bearer = ctx.bearer.clone();
    let status = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(token::exchange_negotiation_token(
            conn,
            &st.handshake.lifetimes,
            &st.node_domain,
            bearer.as_deref(),
            domain.as_deref(),
        )?)
    })
    .await?;

    Ok(json!({
        "domain": status.friendship.peer_domain,
        "status": status.friendship.status,
        "friendship": status.friendship,
        "permanent_credential": status.credential.map(|c| c.token),
    }))
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

pub async fn login(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let LoginParams { domain, credential } = parse_params(params)?;
    let lifetimes = state.handshake.lifetimes;
    let session = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(token::login(
            conn,
            &lifetimes,
            credential.as_deref(),
            domain.as_deref(),
        )?)
    })
    .await?;

    Ok(json!({
        "domain": session.subject_domain,
        "session_token": session.token,
        "token_id": session.token_id,
        "expires_at": session.expires_at,
    }))
}

pub async fn friendship_accept(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let DomainParams { domain } = parse_params(params)?;
    let st = state.clone();
    let accepted = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(friendship::accept_friendship(conn, &st.node_domain, &domain)?)
    })
    .await?;
    Ok(json!(accepted))
}

pub async fn friendship_reject(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let DomainParams { domain } = parse_params(params)?;
    let st = state.clone();
    let rejected = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(friendship::reject_friendship(conn, &st.node_domain, &domain)?)
    })
    .await?;
    Ok(json!(rejected))
}

pub async fn friendship_block(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let DomainParams { domain } = parse_params(params)?;
    let st = state.clone();
    let blocked = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(friendship::block_friendship(conn, &st.node_domain, &domain)?)
    })
    .await?;
    Ok(json!(blocked))
}

#[derive(Debug, Deserialize)]
struct ListFriendshipsParams {
    #[serde(default)]
    status: Option<FriendshipStatus>,
}

pub async fn friendship_list(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let ListFriendshipsParams { status } = parse_params(params)?;
    let friendships = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(friendship::list_friendships(conn, status)?)
    })
    .await?;
    Ok(json!({ "friendships": friendships }))
}

#[derive(Debug, Deserialize)]
struct RevokeParams {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    tier: Option<CredentialTier>,
    #[serde(default)]
    token_id: Option<String>,
}

pub async fn credentials_revoke(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let RevokeParams {
        domain,
        tier,
        token_id,
    } = parse_params(params)?;
    let revoked = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        match (token_id, domain) {
            (Some(id), _) => Ok(usize::from(token::revoke_token_id(conn, &id)?)),
            (None, Some(domain)) => Ok(token::revoke_for_domain(conn, &domain, tier)?),
            (None, None) => Err(RpcError::invalid_params("token_id or domain is required")),
        }
    })
    .await?;
    Ok(json!({ "revoked": revoked }))
}

pub async fn riddle_add(
    state: &Arc<AppState>,
    ctx: &CallContext,
    params: Value,
) -> Result<Value, RpcError> {
    let mut input: NewRiddle = parse_params(params)?;
    if input.created_by.is_none() {
        input.created_by = ctx.identity().map(str::to_string);
    }
    let added = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(riddle::add_riddle(conn, input)?)
    })
    .await?;
    Ok(json!(added))
}

#[derive(Debug, Deserialize)]
struct ListRiddlesParams {
    #[serde(default)]
    category: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

pub async fn riddle_list(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let ListRiddlesParams {
        category,
        page,
        page_size,
    } = parse_params(params)?;
    let (riddles, total) = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(riddle::list_riddles(conn, category.as_deref(), page, page_size)?)
    })
    .await?;
    Ok(json!({
        "riddles": riddles,
        "total": total,
        "page": page,
        "page_size": page_size,
    }))
}

#[derive(Debug, Deserialize)]
struct KeysFetchParams {
    agent_id: String,
    #[serde(default)]
    neighbors: Option<Vec<String>>,
}

pub async fn keys_fetch(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let KeysFetchParams { agent_id, neighbors } = parse_params(params)?;
    let neighbors = match neighbors {
        Some(list) => list,
        None if !state.config.federation.key_neighbors.is_empty() => {
            state.config.federation.key_neighbors.clone()
        }
        None => {
            run_blocking(&state.pool, |conn| -> Result<_, RpcError> {
                Ok(friendship::active_peers(conn)?)
            })
            .await?
        }
    };

    let entry = fetch_public_key(&state.key_cache, &state.remote, &agent_id, &neighbors).await?;
    Ok(json!({
        "key": PublicKeyRecord::from(&entry),
        "ttl_remaining_secs": entry.remaining_secs(),
    }))
}

fn require_peer_domain(state: &AppState, domain: &str) -> Result<(), RpcError> {
    if classify_domain(domain) != DomainClass::Federated {
        return Err(RpcError::invalid_params(format!(
            "peer domain must be federated: {domain}"
        )));
    }
    if domain == state.node_domain {
        return Err(RpcError::invalid_params("cannot join this node itself"));
    }
    Ok(())
}

fn str_field(value: &Value, field: &str) -> Result<String, RemoteError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RemoteError::Decode(format!("join response has no {field}")))
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    peer_domain: String,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default)]
    node_info: Option<Value>,
}

/// Asks a peer for admission and records the riddle it hands out.
pub async fn handshake_join(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let JoinParams {
        peer_domain,
        public_key,
        node_info,
    } = parse_params(params)?;
    require_peer_domain(state, &peer_domain)?;

    let public_key = public_key
        .or_else(|| {
            state
                .config
                .node
                .agents
                .iter()
                .find_map(|agent| agent.public_key.clone())
        })
        .ok_or_else(|| RpcError::invalid_params("public_key is required"))?;
    let node_info = node_info.unwrap_or_else(|| {
        json!({ "name": state.node_domain, "version": env!("CARGO_PKG_VERSION") })
    });

    let url = format!(
        "{}/api/v1/handshake/join-request",
        state.remote.peer_url(&peer_domain)
    );
    let body = json!({
        "domain": state.node_domain,
        "public_key": public_key,
        "node_info": node_info,
    });
    let reply = state.remote.post_json(&url, &body).await?;

    let now = now_millis();
    let handshake = OutboundHandshake {
        session_id: str_field(&reply, "session_id")?,
        peer_domain: peer_domain.clone(),
        riddle_id: str_field(&reply, "riddle_id")?,
        question: str_field(&reply, "question")?,
        challenge_token: str_field(&reply, "challenge_token")?,
        status: HandshakeStatus::Pending,
        created_at: now,
        expires_at: reply
            .get("expires_at")
            .and_then(Value::as_i64)
            .unwrap_or(now + state.handshake.session_ttl_ms),
        completed_at: None,
    };
    let recorded = handshake.clone();
    run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(peer::record_outbound_handshake(conn, &recorded)?)
    })
    .await?;

    tracing::info!(peer = %peer_domain, session_id = %handshake.session_id, "joined peer handshake");
    Ok(json!({
        "session": handshake,
        "category": reply.get("category"),
        "difficulty": reply.get("difficulty"),
    }))
}

#[derive(Debug, Deserialize)]
struct AnswerParams {
    session_id: String,
    answer: String,
}

/// Submits the riddle answer for an outbound handshake, naming this node as
/// the callback for the result.
pub async fn handshake_answer(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let AnswerParams { session_id, answer } = parse_params(params)?;

    let lookup = session_id.clone();
    let handshake = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(peer::get_outbound_handshake(conn, &lookup)?)
    })
    .await?
    .ok_or_else(|| RpcError::new(crate::rpc::NOT_FOUND, "unknown outbound handshake"))?;
    if handshake.status != HandshakeStatus::Pending {
        return Err(RpcError::new(
            crate::rpc::CONFLICT,
            format!("outbound handshake is {}", handshake.status),
        ));
    }

    let url = format!(
        "{}/api/v1/handshake/riddle-response",
        state.remote.peer_url(&handshake.peer_domain)
    );
    let body = json!({
        "session_id": handshake.session_id,
        "riddle_id": handshake.riddle_id,
        "answer": answer,
        "callback_domain": state.node_domain,
        "challenge_token": handshake.challenge_token,
    });
    let reply = state.remote.post_json(&url, &body).await?;

    run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(peer::advance_outbound_handshake(
            conn,
            &session_id,
            &[HandshakeStatus::Pending],
            HandshakeStatus::Answered,
        )?)
    })
    .await?;

    Ok(json!({
        "session_id": handshake.session_id,
        "peer_domain": handshake.peer_domain,
        "peer_status": reply.get("status"),
    }))
}

#[derive(Debug, Deserialize)]
struct ResultParams {
    session_id: String,
    /// The evaluating peer.
    domain: String,
    accepted: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    permanent_credential: Option<String>,
}

/// Receipt of a handshake result from the peer this node asked to join.
pub async fn handshake_result(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let ResultParams {
        session_id,
        domain,
        accepted,
        score,
        feedback,
        permanent_credential,
    } = parse_params(params)?;

    let st = state.clone();
    let log_session = session_id.clone();
    let matched = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        let matched = peer::accept_handshake_result(
            conn,
            &domain,
            &session_id,
            accepted,
            permanent_credential.as_deref(),
        )?;
        if matched && accepted && permanent_credential.is_some() {
            friendship::activate_friendship(conn, &st.node_domain, &domain, score.unwrap_or(0.0))?;
        }
        Ok(matched)
    })
    .await?;

    if !matched {
        tracing::warn!(session_id = %log_session, "handshake result for unknown session ignored");
    } else {
        tracing::info!(session_id = %log_session, accepted, feedback = feedback.as_deref().unwrap_or(""), "handshake result received");
    }
    Ok(json!({ "acknowledged": matched }))
}
