use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::LocalAgentConfig;
use crate::AppState;

/// Header naming the calling local agent.
pub const AGENT_HEADER: &str = "x-botnet-agent";
/// Header carrying the local agent's API key.
pub const AGENT_KEY_HEADER: &str = "x-botnet-agent-key";

/// Rate limiting key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Rate limit by IP address.
    Ip(IpAddr),
    /// Rate limit by caller domain or agent name.
    Domain(String),
}

/// In-memory fixed window rate limiter.
///
/// Each key owns a `(count, window_start)` pair. A request is admitted while
/// the count within the current window is at most the limit.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    state: Arc<Mutex<HashMap<RateLimitKey, (u32, Instant)>>>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RateLimitKey, (u32, Instant)>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("rate limiter lock poisoned, recovering with stale state");
                poisoned.into_inner()
            }
        }
    }

    /// Counts one request against `key`.
    ///
    /// Returns `Err(retry_after_secs)` once the limit for the current window
    /// is exceeded.
    pub fn check(&self, key: RateLimitKey, limit: u32) -> Result<(), u64> {
        let mut state = self.lock();
        let now = Instant::now();
        let window = self.window;

        if state.len() > 10000 {
            state.retain(|_, (_, start)| now.duration_since(*start) <= window);
        }

        let (count, start) = state.entry(key).or_insert((0, now));

        if now.duration_since(*start) > window {
            *count = 1;
            *start = now;
            return Ok(());
        }

        *count = count.saturating_add(1);
        if *count <= limit {
            Ok(())
        } else {
            let left = window.saturating_sub(now.duration_since(*start));
            Err(left.as_secs_f64().ceil().max(1.0) as u64)
        }
    }

    /// Drops every counter whose window has elapsed. Returns how many were removed.
    pub fn gc(&self) -> usize {
        let mut state = self.lock();
        let now = Instant::now();
        let window = self.window;
        let before = state.len();
        state.retain(|_, (_, start)| now.duration_since(*start) <= window);
        before - state.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identity of an inbound caller, resolved from request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// An agent configured on this node.
    LocalAgent(String),
    /// A bearer credential was presented; its tier is resolved later.
    Bearer(String),
    Anonymous,
}

/// Failure to resolve the caller from headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerError {
    /// Malformed authorization header.
    Malformed,
    /// Unknown agent or wrong agent key.
    BadAgentKey,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, CallerError> {
    match headers.get(name) {
        Some(value) => value
            .to_str()
            .map(|s| Some(s.trim()))
            .map_err(|_| CallerError::Malformed),
        None => Ok(None),
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<String>, CallerError> {
    match header_str(headers, "authorization")? {
        Some(value) => match value.strip_prefix("Bearer ") {
            Some(token) if !token.trim().is_empty() => Ok(Some(token.trim().to_string())),
            _ => Err(CallerError::Malformed),
        },
        None => Ok(None),
    }
}

/// Resolves the caller. Agent headers take precedence over a bearer token.
pub fn resolve_caller(
    headers: &HeaderMap,
    agents: &[LocalAgentConfig],
) -> Result<Caller, CallerError> {
    if let Some(name) = header_str(headers, AGENT_HEADER)? {
        let key = header_str(headers, AGENT_KEY_HEADER)?.ok_or(CallerError::BadAgentKey)?;
        let known = agents
            .iter()
            .find(|agent| agent.name == name)
            .ok_or(CallerError::BadAgentKey)?;
        if !keys_match(&known.api_key, key) {
            return Err(CallerError::BadAgentKey);
        }
        return Ok(Caller::LocalAgent(known.name.clone()));
    }

    match bearer_token(headers)? {
        Some(token) => Ok(Caller::Bearer(token)),
        None => Ok(Caller::Anonymous),
    }
}

/// Compares keys without short-circuiting on the first differing byte.
fn keys_match(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Builds a `429` response with a `Retry-After` header.
pub fn too_many_requests(retry_after: u64) -> Response {
    let body = serde_json::json!({
        "error": "rate limit exceeded",
        "retry_after": retry_after,
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response
            .headers_mut()
            .insert(axum::http::header::RETRY_AFTER, value);
    }
    response
}

/// Per-IP rate limiting for the HTTP surface.
///
/// Handshake routes use `rate_limit.handshake_limit`, everything else the
/// default limit. Per-domain write limits are applied inside the RPC
/// dispatcher once the caller is known.
pub async fn rate_limit_middleware(req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?
        .clone();

    let ip = match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip(),
        None => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    };

    let path = req.uri().path().to_string();
    if path == "/health" {
        return Ok(next.run(req).await);
    }
    let limit = if path.contains("/handshake/") {
        state.config.rate_limit.handshake_limit
    } else {
        state.config.rate_limit.default_limit
    };

    if let Err(retry_after) = state.rate_limiter.check(RateLimitKey::Ip(ip), limit) {
        tracing::debug!(%ip, path = %path, retry_after, "request rate limited");
        return Ok(too_many_requests(retry_after));
    }

    Ok(next.run(req).await)
}
