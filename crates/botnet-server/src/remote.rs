//! Outbound calls to peer nodes with bounded timeout and retry.
//!
//! Every call is bounded by `federation.request_timeout_ms` and retried with
//! exponential backoff (`backoff_base_ms * 2^n`) up to
//! `federation.max_attempts` times. Only transport failures, timeouts and
//! 5xx responses are retried; a peer that answered with a definite error is
//! not asked again.

use crate::config::FederationConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("peer returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("peer returned RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("invalid response from peer: {0}")]
    Decode(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("no credential held for peer {0}")]
    NoCredential(String),

    #[error("local storage error: {0}")]
    Storage(String),
}

impl RemoteError {
    fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Timeout(_) => true,
            RemoteError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The `errorCode` of an authentication failure reported by the peer.
    pub fn auth_error_code(&self) -> Option<&str> {
        match self {
            RemoteError::Rpc {
                code: -32001,
                data: Some(data),
                ..
            } => data.get("errorCode").and_then(Value::as_str),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RemoteSettings {
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.request_timeout_ms),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }
}

/// HTTP client for the RPC endpoint and REST surface of peer nodes.
#[derive(Clone)]
pub struct RemoteCallClient {
    http: reqwest::Client,
    settings: RemoteSettings,
    scheme: String,
    peer_urls: Arc<HashMap<String, String>>,
    next_id: Arc<AtomicU64>,
}

impl RemoteCallClient {
    pub fn new(config: &FederationConfig) -> Result<Self, RemoteError> {
        let settings = RemoteSettings::from_config(config);
        let http = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            http,
            settings,
            scheme: config.peer_scheme.clone(),
            peer_urls: Arc::new(config.peer_urls.clone()),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Base URL of a peer: the configured override, or `{scheme}://{domain}`.
    pub fn peer_url(&self, domain: &str) -> String {
        match self.peer_urls.get(domain) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("{}://{}", self.scheme, domain),
        }
    }

    /// Invokes `method` on the peer's RPC endpoint and returns its `result`.
    pub async fn call(
        &self,
        domain: &str,
        method: &str,
        params: Value,
        bearer: Option<&str>,
    ) -> Result<Value, RemoteError> {
        let url = format!("{}/rpc", self.peer_url(domain));
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let envelope = self
            .send_with_retry(method, || {
                let request = self.http.post(&url).json(&body);
                match bearer {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .await?;

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(RemoteError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                data: error.get("data").cloned(),
            });
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| RemoteError::Decode("response has neither result nor error".into()))
    }

    pub async fn post_json(&self, url: &str, body: &Value) -> Result<Value, RemoteError> {
        self.send_with_retry(url, || self.http.post(url).json(body))
            .await
    }

    pub async fn get_json(&self, url: &str) -> Result<Value, RemoteError> {
        self.send_with_retry(url, || self.http.get(url)).await
    }

    async fn send_with_retry<F>(&self, what: &str, build: F) -> Result<Value, RemoteError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 1u32;
        loop {
            match self.send_once(build()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.settings.max_attempts => {
                    let delay = self.settings.backoff_base * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        target_call = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "remote call failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, request: reqwest::RequestBuilder) -> Result<Value, RemoteError> {
        let response = match tokio::time::timeout(self.settings.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(RemoteError::Timeout(self.settings.timeout)),
            Ok(Err(e)) => return Err(RemoteError::Transport(e)),
            Err(_) => return Err(RemoteError::Timeout(self.settings.timeout)),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(text);
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}
