//! Messaging, gossip and polling RPC methods.

use crate::polling::{forward_message, poll_federated_responses};
use crate::rpc::{parse_params, CallContext, RpcError};
use crate::signing::{verify_author, MessageSignature};
use crate::{run_blocking, AppState};
use botnet_federation::FederationError;
use botnet_gossip::{IncomingGossip, NewGossip};
use botnet_messaging::{MessageError, SendRequest};
use botnet_types::time::now_millis;
use botnet_types::{classify_domain, DomainClass, MessageStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
struct SendParams {
    to_domain: String,
    content: String,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    signed_at: Option<i64>,
}

/// Checks the signature of a message a peer forwards for one of its agents,
/// named by `metadata.original_sender`. Returns the verified author.
async fn verify_forwarded(
    state: &AppState,
    origin: &str,
    content: &str,
    metadata: Option<&Value>,
    signed: Option<&MessageSignature>,
) -> Result<Option<String>, RpcError> {
    let author = metadata
        .and_then(|m| m.get("original_sender"))
        .and_then(Value::as_str);
    match (signed, author) {
        (Some(signed), Some(author)) => {
            verify_author(state, author, origin, content, signed).await?;
            Ok(Some(author.to_string()))
        }
        (Some(_), None) => Err(RpcError::invalid_params(
            "signed message has no metadata.original_sender",
        )),
        (None, _) if state.config.federation.require_signatures => {
            Err(FederationError::InvalidSignature("message is not signed".to_string()).into())
        }
        (None, _) => Ok(None),
    }
}

/// Sends a message as the caller. Messages from local agents to another
/// node are also forwarded to that node in the background.
///
/// A signature, when given, must verify against the author's public key.
/// Messages forwarded by peers must be signed unless
/// `federation.require_signatures` is off.
pub async fn message_send(
    state: &Arc<AppState>,
    ctx: &CallContext,
    params: Value,
) -> Result<Value, RpcError> {
    let SendParams {
        to_domain,
        content,
        message_type,
        message_id,
        mut metadata,
        signature,
        signed_at,
    } = parse_params(params)?;
    let caller = ctx.require_identity()?.to_string();
    let signed = MessageSignature::from_parts(signature, signed_at)?;

    if ctx.is_local_agent() {
        if let Some(signed) = &signed {
            verify_author(state, &caller, &state.node_domain, &content, signed).await?;
        }
    } else if let Some(author) =
        verify_forwarded(state, &caller, &content, metadata.as_ref(), signed.as_ref()).await?
    {
        if let Some(Value::Object(fields)) = metadata.as_mut() {
            fields.insert("verified_author".to_string(), json!(author));
        }
    }

    let request = SendRequest {
        from_domain: caller,
        to_domain,
        content,
        message_type,
        message_id,
        metadata,
    };

    let stored = request.clone();
    let message = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(botnet_messaging::send_message(conn, &stored)?)
    })
    .await?;

    if message.status == MessageStatus::SentToFederated && message.to_domain != state.node_domain {
        let st = state.clone();
        let message_id = message.message_id.clone();
        tokio::spawn(async move {
            forward_message(&st, &request, &message_id, signed.as_ref()).await;
        });
    }

    Ok(json!(message))
}

#[derive(Debug, Deserialize)]
struct ReviewParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

/// Inbox and sent messages of the caller. Local callers first collect any
/// responses waiting on federated targets.
pub async fn message_review(
    state: &Arc<AppState>,
    ctx: &CallContext,
    params: Value,
) -> Result<Value, RpcError> {
    let ReviewParams { limit } = parse_params(params)?;
    let domain = ctx.require_identity()?.to_string();

    let poll = if classify_domain(&domain) == DomainClass::Local {
        let pending = run_blocking(&state.pool, |conn| -> Result<_, RpcError> {
            Ok(botnet_messaging::pending_federated(conn)?)
        })
        .await?;
        if pending.is_empty() {
            None
        } else {
            Some(poll_federated_responses(state).await?)
        }
    } else {
        None
    };

    let reviewed = domain.clone();
    let review = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(botnet_messaging::review_messages(conn, &reviewed, limit)?)
    })
    .await?;

    Ok(json!({
        "domain": domain,
        "inbox": review.inbox,
        "sent": review.sent,
        "poll": poll,
    }))
}

#[derive(Debug, Deserialize)]
struct RespondParams {
    message_id: String,
    content: String,
}

/// Responds to a message addressed to the caller. Local agents also answer
/// for messages addressed to this node's own domain.
pub async fn message_respond(
    state: &Arc<AppState>,
    ctx: &CallContext,
    params: Value,
) -> Result<Value, RpcError> {
    let RespondParams {
        message_id,
        content,
    } = parse_params(params)?;
    let caller = ctx.require_identity()?.to_string();
    let local = ctx.is_local_agent();
    let node_domain = state.node_domain.clone();

    let response = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        let message = botnet_messaging::get_message(conn, &message_id)?
            .ok_or_else(|| MessageError::NotFound(message_id.clone()))?;
        let responder = if local && message.to_domain == node_domain {
            node_domain
        } else {
            caller
        };
        Ok(botnet_messaging::set_response(
            conn,
            &message_id,
            &responder,
            &content,
        )?)
    })
    .await?;
    Ok(json!(response))
}

#[derive(Debug, Deserialize)]
struct CheckResponsesParams {
    #[serde(default)]
    message_ids: Option<Vec<String>>,
}

pub async fn message_check_responses(
    state: &Arc<AppState>,
    ctx: &CallContext,
    params: Value,
) -> Result<Value, RpcError> {
    let CheckResponsesParams { message_ids } = parse_params(params)?;
    let caller = ctx.require_identity()?.to_string();
    let responses = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(botnet_messaging::check_responses(
            conn,
            &caller,
            message_ids.as_deref(),
        )?)
    })
    .await?;
    Ok(json!({ "responses": responses }))
}

pub async fn message_delete(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let criteria: botnet_messaging::DeleteCriteria = parse_params(params)?;
    let deleted = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(botnet_messaging::delete_messages(conn, &criteria)?)
    })
    .await?;
    Ok(json!({ "deleted": deleted }))
}

#[derive(Debug, Deserialize)]
struct ExchangeParams {
    #[serde(default)]
    messages: Vec<IncomingGossip>,
}

/// Stores the caller's gossip batch and returns this node's recent messages.
pub async fn gossip_exchange(
    state: &Arc<AppState>,
    ctx: &CallContext,
    params: Value,
) -> Result<Value, RpcError> {
    let ExchangeParams { messages } = parse_params(params)?;
    let source = ctx.require_identity()?.to_string();
    let st = state.clone();
    let report = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(botnet_gossip::handle_exchange(
            conn,
            &st.node_domain,
            &source,
            &messages,
            st.config.gossip.batch_size,
        )?)
    })
    .await?;
    Ok(json!(report))
}

pub async fn gossip_publish(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let input: NewGossip = parse_params(params)?;
    let st = state.clone();
    let message = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(botnet_gossip::publish(conn, &st.node_domain, input)?)
    })
    .await?;
    Ok(json!(message))
}

#[derive(Debug, Deserialize)]
struct GossipListParams {
    #[serde(default)]
    category: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

pub async fn gossip_list(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let GossipListParams { category, limit } = parse_params(params)?;
    let messages = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(botnet_gossip::list_recent(conn, category.as_deref(), limit)?)
    })
    .await?;
    Ok(json!({ "messages": messages }))
}

pub async fn gossip_topology(state: &Arc<AppState>) -> Result<Value, RpcError> {
    let st = state.clone();
    let topology = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(botnet_gossip::network_topology(
            conn,
            &st.node_domain,
            now_millis(),
        )?)
    })
    .await?;
    Ok(json!(topology))
}

pub async fn gossip_delete(state: &Arc<AppState>, params: Value) -> Result<Value, RpcError> {
    let criteria: botnet_gossip::DeleteCriteria = parse_params(params)?;
    let deleted = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        Ok(botnet_gossip::delete_messages(conn, &criteria)?)
    })
    .await?;
    Ok(json!({ "deleted": deleted }))
}

pub async fn federation_poll(state: &Arc<AppState>) -> Result<Value, RpcError> {
    let report = poll_federated_responses(state).await?;
    Ok(json!(report))
}
