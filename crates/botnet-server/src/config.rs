//! Node configuration loading from file and environment variables.

use botnet_federation::JudgeMode;
use botnet_types::{classify_domain, DomainClass, DEFAULT_ACCEPT_THRESHOLD};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "botnet_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// An agent hosted on this node. Agents authenticate with the
/// `X-Botnet-Agent` / `X-Botnet-Agent-Key` header pair.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalAgentConfig {
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// This node's federated domain, e.g. `botnet.example.org`.
    #[serde(default = "default_node_domain")]
    pub domain: String,
    #[serde(default)]
    pub agents: Vec<LocalAgentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Scheme used to reach peers without an explicit URL.
    #[serde(default = "default_peer_scheme")]
    pub peer_scheme: String,
    /// Base URL overrides keyed by peer domain.
    #[serde(default)]
    pub peer_urls: HashMap<String, String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Peers asked for public keys; active friends when empty.
    #[serde(default)]
    pub key_neighbors: Vec<String>,
    /// Refuse messages forwarded by peers unless the authoring agent signed them.
    #[serde(default = "default_require_signatures")]
    pub require_signatures: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default)]
    pub judge: JudgeMode,
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f64,
    /// How long finished sessions are kept.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_negotiation_ttl_secs")]
    pub negotiation_ttl_secs: u64,
    #[serde(default = "default_session_token_ttl_secs")]
    pub session_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests per window per client IP on the RPC endpoint.
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    /// Write operations per window per caller domain.
    #[serde(default = "default_write_limit")]
    pub write_limit: u32,
    /// Handshake REST requests per window per client IP.
    #[serde(default = "default_handshake_limit")]
    pub handshake_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GossipConfig {
    /// Number of own messages returned in a reciprocal exchange.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between pushes to active friends; 0 disables.
    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_public_key_ttl_secs")]
    pub public_key_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Intervals (seconds) of the periodic janitors; 0 disables a janitor.
#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_session_sweep_secs")]
    pub session_sweep_secs: u64,
    #[serde(default = "default_rate_limit_gc_secs")]
    pub rate_limit_gc_secs: u64,
    #[serde(default = "default_credential_purge_secs")]
    pub credential_purge_secs: u64,
    #[serde(default = "default_federation_poll_secs")]
    pub federation_poll_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "botnet.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_domain() -> String {
    "botnet.localhost".to_string()
}

fn default_peer_scheme() -> String {
    "https".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_require_signatures() -> bool {
    true
}

fn default_session_ttl_secs() -> u64 {
    300
}

fn default_accept_threshold() -> f64 {
    DEFAULT_ACCEPT_THRESHOLD
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_negotiation_ttl_secs() -> u64 {
    86_400
}

fn default_session_token_ttl_secs() -> u64 {
    14_400
}

fn default_window_secs() -> u64 {
    60
}

fn default_limit() -> u32 {
    120
}

fn default_write_limit() -> u32 {
    30
}

fn default_handshake_limit() -> u32 {
    10
}

fn default_batch_size() -> usize {
    10
}

fn default_push_interval_secs() -> u64 {
    300
}

fn default_public_key_ttl_secs() -> u64 {
    3_600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_session_sweep_secs() -> u64 {
    60
}

fn default_rate_limit_gc_secs() -> u64 {
    60
}

fn default_credential_purge_secs() -> u64 {
    3_600
}

fn default_federation_poll_secs() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            domain: default_node_domain(),
            agents: Vec::new(),
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            peer_scheme: default_peer_scheme(),
            peer_urls: HashMap::new(),
            request_timeout_ms: default_request_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            key_neighbors: Vec::new(),
            require_signatures: default_require_signatures(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            judge: JudgeMode::default(),
            accept_threshold: default_accept_threshold(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            negotiation_ttl_secs: default_negotiation_ttl_secs(),
            session_ttl_secs: default_session_token_ttl_secs(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            default_limit: default_limit(),
            write_limit: default_write_limit(),
            handshake_limit: default_handshake_limit(),
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            push_interval_secs: default_push_interval_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            public_key_ttl_secs: default_public_key_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            session_sweep_secs: default_session_sweep_secs(),
            rate_limit_gc_secs: default_rate_limit_gc_secs(),
            credential_purge_secs: default_credential_purge_secs(),
            federation_poll_secs: default_federation_poll_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Checks cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if classify_domain(&self.node.domain) != DomainClass::Federated {
            return Err(ConfigError::Invalid(format!(
                "node.domain must be a federated name, got {:?}",
                self.node.domain
            )));
        }
        for agent in &self.node.agents {
            if classify_domain(&agent.name) != DomainClass::Local {
                return Err(ConfigError::Invalid(format!(
                    "agent name must be a local (dot-free) name, got {:?}",
                    agent.name
                )));
            }
            if agent.api_key.len() < 16 {
                return Err(ConfigError::Invalid(format!(
                    "api_key for agent {} must be at least 16 characters",
                    agent.name
                )));
            }
        }
        if self.federation.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "federation.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults when the
/// file does not exist.
///
/// Environment variable overrides:
/// - `BOTNET_HOST` overrides `server.host`
/// - `BOTNET_PORT` overrides `server.port`
/// - `BOTNET_DB_PATH` overrides `database.path`
/// - `BOTNET_LOG_LEVEL` overrides `logging.level`
/// - `BOTNET_LOG_JSON` overrides `logging.json` ("true" or "1" to enable)
/// - `BOTNET_NODE_DOMAIN` overrides `node.domain`
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("BOTNET_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("BOTNET_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("BOTNET_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("BOTNET_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("BOTNET_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(domain) = std::env::var("BOTNET_NODE_DOMAIN") {
        config.node.domain = domain;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            domain = "botnet.alpha.example"

            [[node.agents]]
            name = "scout"
            api_key = "0123456789abcdef"

            [federation.peer_urls]
            "botnet.beta.example" = "http://127.0.0.1:9000"

            [handshake]
            judge = "heuristic"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.domain, "botnet.alpha.example");
        assert_eq!(config.node.agents[0].name, "scout");
        assert_eq!(config.handshake.judge, JudgeMode::Heuristic);
        assert_eq!(config.handshake.session_ttl_secs, 300);
        assert_eq!(config.federation.max_attempts, 3);
        assert_eq!(config.federation.request_timeout_ms, 10_000);
        assert!(config.federation.require_signatures);
        assert_eq!(
            config.federation.peer_urls["botnet.beta.example"],
            "http://127.0.0.1:9000"
        );
        assert_eq!(config.gossip.batch_size, 10);
        assert_eq!(config.cache.public_key_ttl_secs, 3_600);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_non_federated_node_domain() {
        let mut config = Config::default();
        config.node.domain = "example.com".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_dotted_agent_names() {
        let mut config = Config::default();
        config.node.agents.push(LocalAgentConfig {
            name: "scout.bot".to_string(),
            api_key: "0123456789abcdef".to_string(),
            public_key: None,
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.rate_limit.window_secs, 60);
    }
}
