#![allow(dead_code)]

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use botnet_db::{create_pool, run_migrations, DbRuntimeSettings};
use botnet_federation::signature;
use botnet_types::time::now_millis;
use ed25519_dalek::SigningKey;
use botnet_server::config::{Config, LocalAgentConfig};
use botnet_server::middleware::{AGENT_HEADER, AGENT_KEY_HEADER};
use botnet_server::{app, AppState};
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tower::ServiceExt;

pub const OPERATOR: &str = "operator";
pub const OPERATOR_KEY: &str = "operator-key-0123456789";

/// Deterministic signing key of the operator agent on `domain`.
pub fn operator_key(domain: &str) -> SigningKey {
    let mut seed = [0x5au8; 32];
    for (i, b) in domain.bytes().enumerate() {
        seed[i % 32] ^= b;
    }
    SigningKey::from_bytes(&seed)
}

pub fn operator_public_key(domain: &str) -> String {
    signature::public_key_hex(&operator_key(domain))
}

/// `message.send` params carrying `author`'s signature made with `key`.
pub fn signed_send(key: &SigningKey, author: &str, to: &str, content: &str) -> Value {
    let signed_at = now_millis() / 1000;
    json!({
        "to_domain": to,
        "content": content,
        "signed_at": signed_at,
        "signature": signature::sign_message(key, author, content, signed_at),
    })
}

pub fn test_config(domain: &str) -> Config {
    let mut config = Config::default();
    config.node.domain = domain.to_string();
    config.node.agents.push(LocalAgentConfig {
        name: OPERATOR.to_string(),
        api_key: OPERATOR_KEY.to_string(),
        public_key: Some(operator_public_key(domain)),
    });
    config.federation.peer_scheme = "http".to_string();
    config.federation.request_timeout_ms = 2_000;
    config.federation.max_attempts = 2;
    config.federation.backoff_base_ms = 10;
    config
}

pub fn test_state(config: Config) -> (NamedTempFile, AppState) {
    let file = NamedTempFile::new().unwrap();
    let pool = create_pool(file.path().to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
    }
    let state = AppState::new(config, pool).unwrap();
    (file, state)
}

pub fn client_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40000)
}

#[derive(Clone, Copy)]
pub enum Auth<'a> {
    None,
    Agent,
    Bearer(&'a str),
}

pub async fn rpc(app: &Router, method: &str, params: Value, auth: Auth<'_>) -> Value {
    let body = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
    let mut builder = Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("content-type", "application/json");
    builder = match auth {
        Auth::None => builder,
        Auth::Agent => builder
            .header(AGENT_HEADER, OPERATOR)
            .header(AGENT_KEY_HEADER, OPERATOR_KEY),
        Auth::Bearer(token) => builder.header("authorization", format!("Bearer {token}")),
    };
    let mut request = builder.body(Body::from(body.to_string())).unwrap();
    request.extensions_mut().insert(ConnectInfo(client_addr()));

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    agent: bool,
) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if agent {
        builder = builder
            .header(AGENT_HEADER, OPERATOR)
            .header(AGENT_KEY_HEADER, OPERATOR_KEY);
    }
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    let mut request = builder.body(body).unwrap();
    request.extensions_mut().insert(ConnectInfo(client_addr()));

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, value)
}

pub fn ok(response: &Value) -> &Value {
    assert!(
        response.get("error").is_none(),
        "unexpected rpc error: {response}"
    );
    &response["result"]
}

pub fn error_code(response: &Value) -> i64 {
    response["error"]["code"]
        .as_i64()
        .unwrap_or_else(|| panic!("expected rpc error, got {response}"))
}

/// Binds a listener on an ephemeral local port and returns it with its base URL.
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// A base URL nothing listens on.
pub async fn dead_url() -> String {
    let (listener, url) = bind().await;
    drop(listener);
    url
}

pub fn serve(listener: TcpListener, state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        axum::serve(
            listener,
            app(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    })
}

/// Polls `check` until it returns true or about two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
