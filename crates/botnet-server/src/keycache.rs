//! TTL cache of agent public keys and the neighbor fetcher that fills it.

use crate::remote::RemoteCallClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// A cached public key and the node that vouched for it.
#[derive(Debug, Clone)]
pub struct CachedPublicKey {
    pub agent_id: String,
    pub public_key: String,
    pub owner_node_id: String,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedPublicKey {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.cached_at) >= self.ttl
    }

    /// Seconds until this entry expires.
    pub fn remaining_secs(&self) -> u64 {
        self.ttl
            .saturating_sub(self.cached_at.elapsed())
            .as_secs()
    }
}

/// Wire shape of a key served by the key endpoint and returned by `keys.fetch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    pub agent_id: String,
    pub public_key: String,
    pub node_id: String,
}

impl From<&CachedPublicKey> for PublicKeyRecord {
    fn from(entry: &CachedPublicKey) -> Self {
        Self {
            agent_id: entry.agent_id.clone(),
            public_key: entry.public_key.clone(),
            node_id: entry.owner_node_id.clone(),
        }
    }
}

/// In-memory public key cache with per-entry TTL.
///
/// Expired entries are removed when read and by [`PublicKeyCache::remove_expired`],
/// which the background sweep calls periodically.
#[derive(Clone, Debug)]
pub struct PublicKeyCache {
    entries: Arc<RwLock<HashMap<String, CachedPublicKey>>>,
    default_ttl: Duration,
}

impl PublicKeyCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CachedPublicKey>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("public key cache lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CachedPublicKey>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("public key cache lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<CachedPublicKey> {
        let now = Instant::now();
        {
            let entries = self.read();
            match entries.get(agent_id) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Re-check under the write lock; a concurrent set may have refreshed it.
        let mut entries = self.write();
        let expired = match entries.get(agent_id) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(agent_id);
        }
        None
    }

    /// Stores a key. `ttl` of `None` uses the cache default.
    pub fn set(
        &self,
        agent_id: &str,
        public_key: &str,
        owner_node_id: &str,
        ttl: Option<Duration>,
    ) -> CachedPublicKey {
        let entry = CachedPublicKey {
            agent_id: agent_id.to_string(),
            public_key: public_key.to_string(),
            owner_node_id: owner_node_id.to_string(),
            cached_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
        };
        self.write().insert(agent_id.to_string(), entry.clone());
        entry
    }

    pub fn delete(&self, agent_id: &str) -> bool {
        self.write().remove(agent_id).is_some()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

#[derive(Debug, Error)]
pub enum KeyFetchError {
    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),

    #[error("no neighbors configured to fetch public key for {0}")]
    NoNeighbors(String),

    #[error("public key for {agent_id} not found on any neighbor: {failures:?}")]
    NotFound {
        agent_id: String,
        failures: Vec<String>,
    },
}

/// Agent ids go into the key endpoint's path, so only `[A-Za-z0-9._-]` is
/// accepted, and `.`/`..` are refused as they would rewrite the path.
pub fn valid_agent_id(agent_id: &str) -> bool {
    !agent_id.is_empty()
        && agent_id != "."
        && agent_id != ".."
        && agent_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

async fn request_key(
    remote: &RemoteCallClient,
    neighbor: &str,
    agent_id: &str,
) -> Result<PublicKeyRecord, String> {
    let url = format!(
        "{}/api/v1/agents/{}/publickey",
        remote.peer_url(neighbor),
        agent_id
    );
    let body = remote.get_json(&url).await.map_err(|e| e.to_string())?;
    parse_key_response(&body, agent_id)
}

/// Returns the cached key for `agent_id`, or asks each neighbor in order
/// until one serves it. The first success is cached under the node id the
/// neighbor reports (falling back to the neighbor's domain).
pub async fn fetch_public_key(
    cache: &PublicKeyCache,
    remote: &RemoteCallClient,
    agent_id: &str,
    neighbors: &[String],
) -> Result<CachedPublicKey, KeyFetchError> {
    if !valid_agent_id(agent_id) {
        return Err(KeyFetchError::InvalidAgentId(agent_id.to_string()));
    }
    if let Some(hit) = cache.get(agent_id) {
        tracing::debug!(agent_id, "public key cache hit");
        return Ok(hit);
    }
    if neighbors.is_empty() {
        return Err(KeyFetchError::NoNeighbors(agent_id.to_string()));
    }

    let mut failures = Vec::with_capacity(neighbors.len());
    for neighbor in neighbors {
        match request_key(remote, neighbor, agent_id).await {
            Ok(record) => {
                let owner = if record.node_id.is_empty() {
                    neighbor.as_str()
                } else {
                    record.node_id.as_str()
                };
                tracing::info!(agent_id, neighbor = %neighbor, owner, "fetched public key");
                return Ok(cache.set(agent_id, &record.public_key, owner, None));
            }
            Err(reason) => failures.push(format!("{}: {}", neighbor, reason)),
        }
    }

    tracing::warn!(agent_id, attempts = failures.len(), "public key fetch failed on every neighbor");
    Err(KeyFetchError::NotFound {
        agent_id: agent_id.to_string(),
        failures,
    })
}

/// Returns the key of `agent_id` as served by its home node `owner`.
///
/// Agent names are only unique per node, so these entries are cached under
/// `agent_id@owner` and never answered from another neighbor. A node id in
/// the reply that differs from `owner` counts as a failure.
pub async fn fetch_owned_key(
    cache: &PublicKeyCache,
    remote: &RemoteCallClient,
    agent_id: &str,
    owner: &str,
) -> Result<CachedPublicKey, KeyFetchError> {
    if !valid_agent_id(agent_id) {
        return Err(KeyFetchError::InvalidAgentId(agent_id.to_string()));
    }
    let qualified = format!("{agent_id}@{owner}");
    if let Some(hit) = cache.get(&qualified) {
        tracing::debug!(agent_id, owner, "owned public key cache hit");
        return Ok(hit);
    }

    let failure = match request_key(remote, owner, agent_id).await {
        Ok(record) if record.node_id.is_empty() || record.node_id == owner => {
            tracing::info!(agent_id, owner, "fetched public key from home node");
            return Ok(cache.set(&qualified, &record.public_key, owner, None));
        }
        Ok(record) => format!("{owner}: key served for node {}", record.node_id),
        Err(reason) => format!("{owner}: {reason}"),
    };
    tracing::warn!(agent_id, owner, "public key fetch from home node failed: {}", failure);
    Err(KeyFetchError::NotFound {
        agent_id: qualified,
        failures: vec![failure],
    })
}

fn parse_key_response(body: &Value, agent_id: &str) -> Result<PublicKeyRecord, String> {
    if !body.get("success").and_then(Value::as_bool).unwrap_or(false) {
        let reason = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unsuccessful response");
        return Err(reason.to_string());
    }
    let data = body.get("data").ok_or("response has no data")?;
    let public_key = data
        .get("public_key")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .ok_or("response has no public_key")?;
    Ok(PublicKeyRecord {
        agent_id: agent_id.to_string(),
        public_key: public_key.to_string(),
        node_id: data
            .get("node_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_after_set_returns_value() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));
        cache.set("scout", "pk-1", "botnet.alpha.example", None);

        let hit = cache.get("scout").unwrap();
        assert_eq!(hit.public_key, "pk-1");
        assert_eq!(hit.owner_node_id, "botnet.alpha.example");
        assert!(hit.remaining_secs() <= 60);
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));
        cache.set("scout", "pk-1", "botnet.alpha.example", Some(Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(40));

        assert!(cache.get("scout").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));
        cache.set("old", "pk-old", "n", Some(Duration::from_millis(10)));
        cache.set("new", "pk-new", "n", None);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.remove_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn delete_and_clear() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));
        cache.set("a", "1", "n", None);
        cache.set("b", "2", "n", None);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_sets_of_distinct_ids_are_kept() {
        let cache = PublicKeyCache::new(Duration::from_secs(60));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        cache.set(&format!("agent-{}-{}", i, j), "pk", "n", None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 400);
        assert!(cache.get("agent-3-49").is_some());
    }

    #[test]
    fn agent_ids_are_limited_to_path_safe_characters() {
        for ok in ["scout", "scout-2", "scout_b", "a.b", "A9"] {
            assert!(valid_agent_id(ok), "{ok}");
        }
        for bad in ["", ".", "..", "a/b", "a?b", "a#b", "a%2fb", "a b", "ä"] {
            assert!(!valid_agent_id(bad), "{bad:?}");
        }
    }

    #[test]
    fn parses_key_endpoint_body() {
        let body = json!({
            "success": true,
            "data": {"agent_id": "scout", "public_key": "pk", "node_id": "botnet.alpha.example"},
            "error": null
        });
        let record = parse_key_response(&body, "scout").unwrap();
        assert_eq!(record.node_id, "botnet.alpha.example");

        let body = json!({"success": false, "data": null, "error": "unknown agent"});
        assert_eq!(parse_key_response(&body, "scout").unwrap_err(), "unknown agent");
    }
}
