//! Botnet node server: the HTTP transport in front of the federation,
//! gossip and messaging services.
//!
//! One JSON-RPC endpoint (`POST /rpc`) carries every tiered operation; the
//! admission handshake additionally has a REST surface under
//! `/api/v1/handshake`. Outbound traffic to peers goes through
//! [`remote::RemoteCallClient`].

pub mod api;
pub mod api_handshake;
pub mod background;
pub mod config;
pub mod keycache;
pub mod middleware;
pub mod peers;
pub mod polling;
pub mod remote;
pub mod rpc;
pub mod rpc_exchange;
pub mod rpc_trust;
pub mod signing;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use botnet_db::DbPool;
use botnet_federation::{
    ExternalJudge, HandshakeSettings, HeuristicJudge, JudgeMode, RiddleJudge, TokenLifetimes,
};
use config::Config;
use keycache::PublicKeyCache;
use middleware::RateLimiter;
use remote::{RemoteCallClient, RemoteError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    pub config: Arc<Config>,
    /// This node's federated domain.
    pub node_domain: String,
    pub handshake: HandshakeSettings,
    pub rate_limiter: RateLimiter,
    pub key_cache: PublicKeyCache,
    pub remote: RemoteCallClient,
    /// Scores riddle answers, or defers them to an external evaluator.
    pub judge: Arc<dyn RiddleJudge>,
}

impl AppState {
    pub fn new(config: Config, pool: DbPool) -> Result<Self, RemoteError> {
        let handshake = HandshakeSettings {
            session_ttl_ms: secs_to_millis(config.handshake.session_ttl_secs),
            accept_threshold: config.handshake.accept_threshold,
            retention_ms: secs_to_millis(config.handshake.retention_secs),
            lifetimes: TokenLifetimes {
                negotiation_ms: secs_to_millis(config.tokens.negotiation_ttl_secs),
                session_ms: secs_to_millis(config.tokens.session_ttl_secs),
            },
        };
        let judge: Arc<dyn RiddleJudge> = match config.handshake.judge {
            JudgeMode::External => Arc::new(ExternalJudge),
            JudgeMode::Heuristic => Arc::new(HeuristicJudge::new(config.handshake.accept_threshold)),
        };

        Ok(Self {
            pool,
            node_domain: config.node.domain.clone(),
            handshake,
            rate_limiter: RateLimiter::new(Duration::from_secs(config.rate_limit.window_secs)),
            key_cache: PublicKeyCache::new(Duration::from_secs(config.cache.public_key_ttl_secs)),
            remote: RemoteCallClient::new(&config.federation)?,
            judge,
            config: Arc::new(config),
        })
    }
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Failure to run a database closure on the blocking pool.
#[derive(Debug, Error)]
pub enum BlockingError {
    #[error("db connection failed: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs `f` with a pooled connection on the blocking thread pool.
pub async fn run_blocking<T, E, F>(pool: &DbPool, f: F) -> Result<T, E>
where
    F: FnOnce(&rusqlite::Connection) -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<BlockingError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| E::from(BlockingError::Pool(e)))?;
        f(&conn)
    })
    .await
    .map_err(|e| E::from(BlockingError::Join(e)))?
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let handshake_routes = Router::new()
        .route("/join-request", post(api_handshake::join_request_handler))
        .route("/riddle-response", post(api_handshake::riddle_response_handler))
        .route("/result", post(api_handshake::result_handler))
        .route("/status/{session_id}", get(api_handshake::status_handler));

    Router::new()
        .route("/health", get(api::health))
        .route("/rpc", post(rpc::rpc_handler))
        .route(
            "/api/v1/agents/{agent_id}/publickey",
            get(api::agent_public_key_handler),
        )
        .nest("/api/v1/handshake", handshake_routes.clone())
        .nest("/handshake", handshake_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::rate_limit_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
