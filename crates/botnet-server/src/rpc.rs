//! JSON-RPC 2.0 endpoint.
//!
//! Every method declares the minimum access it needs in [`method_access`].
//! Bearer tokens are resolved to a domain and tier by server-side lookup;
//! configured local agents satisfy every tier. Errors are returned as
//! JSON-RPC error objects with HTTP 200.

use crate::keycache::KeyFetchError;
use crate::middleware::{resolve_caller, Caller, CallerError, RateLimitKey};
use crate::remote::RemoteError;
use crate::{rpc_exchange, rpc_trust, run_blocking, AppState, BlockingError};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Extension, Json},
    http::HeaderMap,
};
use botnet_federation::{token, FederationError};
use botnet_gossip::GossipError;
use botnet_messaging::MessageError;
use botnet_types::{AuthErrorCode, CredentialTier};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const AUTH_FAILED: i64 = -32001;
pub const RATE_LIMITED: i64 = -32002;
pub const FORBIDDEN: i64 = -32003;
pub const NOT_FOUND: i64 = -32004;
pub const CONFLICT: i64 = -32009;
pub const REMOTE_UNAVAILABLE: i64 = -32010;
pub const SIGNATURE_REJECTED: i64 = -32011;

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        tracing::error!("rpc internal error: {}", detail);
        Self::new(INTERNAL_ERROR, "internal error")
    }

    pub fn auth(code: AuthErrorCode) -> Self {
        Self::new(AUTH_FAILED, "authentication failed").with_data(json!({ "errorCode": code }))
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        Self::new(RATE_LIMITED, "rate limit exceeded")
            .with_data(json!({ "retryAfter": retry_after }))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(FORBIDDEN, message)
    }

    fn envelope(self, id: Value) -> Value {
        let mut error = json!({ "code": self.code, "message": self.message });
        if let Some(data) = self.data {
            error["data"] = data;
        }
        json!({ "jsonrpc": "2.0", "error": error, "id": id })
    }
}

impl From<FederationError> for RpcError {
    fn from(err: FederationError) -> Self {
        match err {
            FederationError::Validation(msg) => RpcError::invalid_params(msg),
            FederationError::NotFound(msg) => RpcError::new(NOT_FOUND, msg),
            FederationError::InvalidSession => RpcError::new(NOT_FOUND, err.to_string()),
            FederationError::InvalidTransition(msg) => RpcError::new(CONFLICT, msg),
            FederationError::Forbidden(msg) => RpcError::forbidden(msg),
            FederationError::Auth(code) => RpcError::auth(code),
            FederationError::InvalidSignature(reason) => {
                RpcError::new(SIGNATURE_REJECTED, "signature rejected")
                    .with_data(json!({ "reason": reason }))
            }
            FederationError::Database(e) => RpcError::internal(e),
        }
    }
}

impl From<GossipError> for RpcError {
    fn from(err: GossipError) -> Self {
        match err {
            GossipError::Validation(msg) => RpcError::invalid_params(msg),
            GossipError::InvalidDomain(_) => RpcError::new(CONFLICT, err.to_string()),
            GossipError::Database(e) => RpcError::internal(e),
        }
    }
}

impl From<MessageError> for RpcError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Validation(msg) => RpcError::invalid_params(msg),
            MessageError::InvalidDomain(_) | MessageError::DuplicateMessage(_) => {
                RpcError::new(CONFLICT, err.to_string())
            }
            MessageError::NotFound(_) => RpcError::new(NOT_FOUND, err.to_string()),
            MessageError::Forbidden(msg) => RpcError::forbidden(msg),
            MessageError::Database(e) => RpcError::internal(e),
        }
    }
}

impl From<BlockingError> for RpcError {
    fn from(err: BlockingError) -> Self {
        RpcError::internal(err)
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Storage(detail) => RpcError::internal(detail),
            other => RpcError::new(REMOTE_UNAVAILABLE, "remote peer unavailable")
                .with_data(json!({ "reason": other.to_string() })),
        }
    }
}

impl From<KeyFetchError> for RpcError {
    fn from(err: KeyFetchError) -> Self {
        match err {
            KeyFetchError::InvalidAgentId(_) => RpcError::invalid_params(err.to_string()),
            KeyFetchError::NoNeighbors(_) => RpcError::new(REMOTE_UNAVAILABLE, err.to_string()),
            KeyFetchError::NotFound { failures, .. } => {
                RpcError::new(NOT_FOUND, "public key not found on any neighbor")
                    .with_data(json!({ "failures": failures }))
            }
        }
    }
}

/// What a method requires of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    /// Validates a permanent credential passed in params.
    Login,
    Tier(CredentialTier),
    /// Operator methods, only for agents configured on this node.
    LocalAgent,
}

pub fn method_access(method: &str) -> Option<Access> {
    use CredentialTier::{Negotiation, Session};
    let access = match method {
        "ping" | "friendship.request" | "handshake.result" => Access::Public,
        "login" => Access::Login,
        "friendship.status" => Access::Tier(Negotiation),
        "message.send"
        | "message.review"
        | "message.respond"
        | "message.checkResponses"
        | "gossip.exchange"
        | "gossip.list"
        | "gossip.topology" => Access::Tier(Session),
        "friendship.accept"
        | "friendship.reject"
        | "friendship.block"
        | "friendship.list"
        | "credentials.revoke"
        | "riddle.add"
        | "riddle.list"
        | "message.delete"
        | "gossip.publish"
        | "gossip.delete"
        | "federation.poll"
        | "keys.fetch"
        | "handshake.join"
        | "handshake.answer" => Access::LocalAgent,
        _ => return None,
    };
    Some(access)
}

/// Methods counted against the per-caller write limit.
const WRITE_METHODS: &[&str] = &[
    "friendship.request",
    "login",
    "message.send",
    "message.respond",
    "gossip.exchange",
    "gossip.publish",
];

/// Who is calling, after authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    LocalAgent(String),
    Peer {
        domain: String,
        tier: CredentialTier,
    },
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct CallContext {
    pub principal: Principal,
    pub ip: IpAddr,
    /// The raw bearer token, when one was presented.
    pub bearer: Option<String>,
}

impl CallContext {
    /// The caller's domain: the agent name or the authenticated peer domain.
    pub fn identity(&self) -> Option<&str> {
        match &self.principal {
            Principal::LocalAgent(name) => Some(name),
            Principal::Peer { domain, .. } => Some(domain),
            Principal::Anonymous => None,
        }
    }

    pub fn require_identity(&self) -> Result<&str, RpcError> {
        self.identity()
            .ok_or_else(|| RpcError::auth(AuthErrorCode::MissingAuth))
    }

    pub fn is_local_agent(&self) -> bool {
        matches!(self.principal, Principal::LocalAgent(_))
    }
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

/// Deserializes method params; absent params read as `{}`.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn parse_request(body: &[u8]) -> Result<RpcRequest, (Value, RpcError)> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| (Value::Null, RpcError::new(PARSE_ERROR, format!("parse error: {e}"))))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    if !value.is_object() {
        return Err((id, RpcError::new(INVALID_REQUEST, "request must be a JSON object")));
    }
    let request: RpcRequest = serde_json::from_value(value)
        .map_err(|e| (id.clone(), RpcError::new(INVALID_REQUEST, e.to_string())))?;
    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        return Err((id, RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\"")));
    }
    if !(request.params.is_null() || request.params.is_object()) {
        return Err((id, RpcError::invalid_params("params must be an object")));
    }
    Ok(request)
}

/// Handler for `POST /rpc`.
pub async fn rpc_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err((id, error)) => return Json(error.envelope(id)),
    };
    let id = request.id.clone();
    let method = request.method.clone();

    match dispatch(&state, addr.ip(), &headers, request).await {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "result": result, "id": id })),
        Err(error) => {
            tracing::debug!(method = %method, code = error.code, "rpc call failed: {}", error.message);
            Json(error.envelope(id))
        }
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    ip: IpAddr,
    headers: &HeaderMap,
    request: RpcRequest,
) -> Result<Value, RpcError> {
    let access = method_access(&request.method).ok_or_else(|| {
        RpcError::new(METHOD_NOT_FOUND, format!("method not found: {}", request.method))
    })?;
    let ctx = authenticate(state, ip, headers, access, &request.params).await?;

    if WRITE_METHODS.contains(&request.method.as_str()) {
        let key = match ctx.identity() {
            Some(identity) => RateLimitKey::Domain(identity.to_string()),
            None => match request.params.get("domain").and_then(Value::as_str) {
                Some(domain) => RateLimitKey::Domain(domain.to_string()),
                None => RateLimitKey::Ip(ip),
            },
        };
        state
            .rate_limiter
            .check(key, state.config.rate_limit.write_limit)
            .map_err(RpcError::rate_limited)?;
    }

    let params = request.params;
    match request.method.as_str() {
        "ping" => Ok(rpc_trust::ping(state)),
        "friendship.request" => rpc_trust::friendship_request(state, params).await,
        "friendship.status" => rpc_trust::friendship_status(state, &ctx, params).await,
        "login" => rpc_trust::login(state, params).await,
        "friendship.accept" => rpc_trust::friendship_accept(state, params).await,
        "friendship.reject" => rpc_trust::friendship_reject(state, params).await,
        "friendship.block" => rpc_trust::friendship_block(state, params).await,
        "friendship.list" => rpc_trust::friendship_list(state, params).await,
        "credentials.revoke" => rpc_trust::credentials_revoke(state, params).await,
        "riddle.add" => rpc_trust::riddle_add(state, &ctx, params).await,
        "riddle.list" => rpc_trust::riddle_list(state, params).await,
        "keys.fetch" => rpc_trust::keys_fetch(state, params).await,
        "handshake.join" => rpc_trust::handshake_join(state, params).await,
        "handshake.answer" => rpc_trust::handshake_answer(state, params).await,
        "handshake.result" => rpc_trust::handshake_result(state, params).await,
        "message.send" => rpc_exchange::message_send(state, &ctx, params).await,
        "message.review" => rpc_exchange::message_review(state, &ctx, params).await,
        "message.respond" => rpc_exchange::message_respond(state, &ctx, params).await,
        "message.checkResponses" => rpc_exchange::message_check_responses(state, &ctx, params).await,
        "message.delete" => rpc_exchange::message_delete(state, params).await,
        "gossip.exchange" => rpc_exchange::gossip_exchange(state, &ctx, params).await,
        "gossip.publish" => rpc_exchange::gossip_publish(state, params).await,
        "gossip.list" => rpc_exchange::gossip_list(state, params).await,
        "gossip.topology" => rpc_exchange::gossip_topology(state).await,
        "gossip.delete" => rpc_exchange::gossip_delete(state, params).await,
        "federation.poll" => rpc_exchange::federation_poll(state).await,
        other => Err(RpcError::new(METHOD_NOT_FOUND, format!("method not found: {other}"))),
    }
}

async fn authenticate(
    state: &Arc<AppState>,
    ip: IpAddr,
    headers: &HeaderMap,
    access: Access,
    params: &Value,
) -> Result<CallContext, RpcError> {
    let caller = resolve_caller(headers, &state.config.node.agents).map_err(|e| match e {
        CallerError::Malformed | CallerError::BadAgentKey => {
            RpcError::auth(AuthErrorCode::InvalidToken)
        }
    })?;

    let (principal, bearer) = match (caller, access) {
        (Caller::LocalAgent(name), _) => (Principal::LocalAgent(name), None),
        (Caller::Bearer(_), Access::LocalAgent) => {
            return Err(RpcError::forbidden("operator methods require a local agent"))
        }
        (Caller::Anonymous, Access::LocalAgent) => {
            return Err(RpcError::auth(AuthErrorCode::MissingAuth))
        }
        (Caller::Bearer(token), Access::Tier(required)) => {
            let requested = params
                .get("domain")
                .or_else(|| params.get("from_domain"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let presented = token.clone();
            let auth = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
                Ok(token::validate(conn, Some(presented.as_str()), required, requested.as_deref())?
                    .into_result()?)
            })
            .await?;
            let domain = auth
                .domain
                .ok_or_else(|| RpcError::auth(AuthErrorCode::InvalidToken))?;
            (
                Principal::Peer {
                    domain,
                    tier: required,
                },
                Some(token),
            )
        }
        (Caller::Anonymous, Access::Tier(_)) => {
            return Err(RpcError::auth(AuthErrorCode::MissingAuth))
        }
        (Caller::Bearer(token), _) => (Principal::Anonymous, Some(token)),
        (Caller::Anonymous, _) => (Principal::Anonymous, None),
    };

    Ok(CallContext {
        principal,
        ip,
        bearer,
    })
}
