use crate::GossipError;
use botnet_federation::friendship;
use botnet_types::time::now_millis;
use botnet_types::{
    classify_domain, DomainClass, ANONYMOUS_SOURCE, RECEIVED_CONFIDENCE, SELF_CONFIDENCE,
};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub message_id: String,
    pub source_id: String,
    pub content: String,
    pub category: String,
    pub confidence_score: f64,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// A gossip message as carried on the wire by `gossip.exchange`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingGossip {
    pub message_id: String,
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl From<GossipMessage> for IncomingGossip {
    fn from(m: GossipMessage) -> Self {
        Self {
            message_id: m.message_id,
            content: m.content,
            category: Some(m.category),
            confidence_score: Some(m.confidence_score),
            metadata: Some(m.metadata),
            created_at: Some(m.created_at),
        }
    }
}

/// A self-authored message for [`publish`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewGossip {
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeReport {
    pub received: usize,
    pub duplicates: usize,
    /// Stored source id the batch was attributed to.
    pub source_id: String,
    /// This node's most recent self-authored messages.
    pub messages: Vec<GossipMessage>,
}

/// Criteria for [`delete_messages`]. Set fields are combined with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteCriteria {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Epoch milliseconds; messages received before this are matched.
    #[serde(default)]
    pub older_than: Option<i64>,
}

impl DeleteCriteria {
    fn is_empty(&self) -> bool {
        self.message_id.is_none()
            && self.source_id.is_none()
            && self.category.is_none()
            && self.older_than.is_none()
    }
}

/// Maps a caller identifier to the source id gossip is stored under:
/// federated domains keep their name, local names become `"anonymous"`.
pub fn record_source(source: &str) -> Result<String, GossipError> {
    match classify_domain(source) {
        DomainClass::Federated => Ok(source.to_string()),
        DomainClass::Local => Ok(ANONYMOUS_SOURCE.to_string()),
        DomainClass::Invalid => Err(GossipError::InvalidDomain(source.to_string())),
    }
}

fn clamp_confidence(value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 100.0),
        _ => default,
    }
}

/// Inserts one message unless its id is already known in either store.
/// Returns whether a row was written.
fn insert_if_absent(conn: &Connection, source_id: &str, msg: &GossipMessage) -> Result<bool, GossipError> {
    let (table, other) = if source_id == ANONYMOUS_SOURCE {
        ("anonymous_gossip", "gossip_messages")
    } else {
        ("gossip_messages", "anonymous_gossip")
    };
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {table}
                 (message_id, source_id, content, category, confidence_score, metadata, created_at, received_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
             WHERE NOT EXISTS (SELECT 1 FROM {other} WHERE message_id = ?1)"
        ),
        params![
            msg.message_id,
            source_id,
            msg.content,
            msg.category,
            msg.confidence_score,
            msg.metadata.to_string(),
            msg.created_at,
            now_millis(),
        ],
    )?;
    Ok(inserted == 1)
}

/// Stores a batch received from `source`, refreshes the matching
/// friendship's `last_seen`, and returns up to `batch` of this node's own
/// recent messages.
pub fn handle_exchange(
    conn: &Connection,
    node_domain: &str,
    source: &str,
    messages: &[IncomingGossip],
    batch: usize,
) -> Result<ExchangeReport, GossipError> {
    let source_id = record_source(source)?;

    for m in messages {
        if m.message_id.trim().is_empty() {
            return Err(GossipError::Validation("message_id is required".to_string()));
        }
        if m.content.trim().is_empty() {
            return Err(GossipError::Validation(format!(
                "message {} has no content",
                m.message_id
            )));
        }
    }

    let now = now_millis();
    let tx = conn.unchecked_transaction()?;
    let mut received = 0;
    let mut duplicates = 0;
    for m in messages {
        let message = GossipMessage {
            message_id: m.message_id.clone(),
            source_id: source_id.clone(),
            content: m.content.clone(),
            category: m.category.clone().unwrap_or_else(|| "general".to_string()),
            confidence_score: clamp_confidence(m.confidence_score, RECEIVED_CONFIDENCE),
            metadata: m
                .metadata
                .clone()
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            created_at: m.created_at.unwrap_or(now),
        };
        if insert_if_absent(&tx, &source_id, &message)? {
            received += 1;
        } else {
            duplicates += 1;
        }
    }

    if source_id != ANONYMOUS_SOURCE {
        friendship::touch_last_seen(&tx, node_domain, &source_id)?;
    }
    tx.commit()?;

    tracing::info!(source = %source_id, received, duplicates, "gossip exchange");

    Ok(ExchangeReport {
        received,
        duplicates,
        source_id,
        messages: recent_self_authored(conn, node_domain, batch)?,
    })
}

/// Publishes a message authored by this node.
pub fn publish(
    conn: &Connection,
    node_domain: &str,
    input: NewGossip,
) -> Result<GossipMessage, GossipError> {
    if input.content.trim().is_empty() {
        return Err(GossipError::Validation("content is required".to_string()));
    }
    let message = GossipMessage {
        message_id: uuid::Uuid::new_v4().to_string(),
        source_id: node_domain.to_string(),
        content: input.content,
        category: input.category.unwrap_or_else(|| "general".to_string()),
        confidence_score: clamp_confidence(input.confidence_score, SELF_CONFIDENCE),
        metadata: input
            .metadata
            .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
        created_at: now_millis(),
    };
    insert_if_absent(conn, node_domain, &message)?;
    tracing::debug!(message_id = %message.message_id, "published gossip");
    Ok(message)
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<GossipMessage> {
    let metadata: String = row.get(5)?;
    Ok(GossipMessage {
        message_id: row.get(0)?,
        source_id: row.get(1)?,
        content: row.get(2)?,
        category: row.get(3)?,
        confidence_score: row.get(4)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: row.get(6)?,
    })
}

/// The node's own most recent messages, newest first.
pub fn recent_self_authored(
    conn: &Connection,
    node_domain: &str,
    limit: usize,
) -> Result<Vec<GossipMessage>, GossipError> {
    let mut stmt = conn.prepare(
        "SELECT message_id, source_id, content, category, confidence_score, metadata, created_at
         FROM gossip_messages WHERE source_id = ?1
         ORDER BY created_at DESC, message_id LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![node_domain, limit as i64], row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Most recent messages across both stores, optionally filtered by category.
pub fn list_recent(
    conn: &Connection,
    category: Option<&str>,
    limit: usize,
) -> Result<Vec<GossipMessage>, GossipError> {
    let mut stmt = conn.prepare(
        "SELECT message_id, source_id, content, category, confidence_score, metadata, created_at
         FROM (
             SELECT message_id, source_id, content, category, confidence_score, metadata, created_at
             FROM gossip_messages
             UNION ALL
             SELECT message_id, source_id, content, category, confidence_score, metadata, created_at
             FROM anonymous_gossip
         )
         WHERE ?1 IS NULL OR category = ?1
         ORDER BY created_at DESC, message_id LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![category, limit as i64], row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Purges matching messages from both stores. At least one criterion is
/// required.
pub fn delete_messages(conn: &Connection, criteria: &DeleteCriteria) -> Result<usize, GossipError> {
    if criteria.is_empty() {
        return Err(GossipError::Validation(
            "at least one delete criterion is required".to_string(),
        ));
    }

    let tx = conn.unchecked_transaction()?;
    let mut deleted = 0;
    for table in ["gossip_messages", "anonymous_gossip"] {
        deleted += tx.execute(
            &format!(
                "DELETE FROM {table}
                 WHERE (?1 IS NULL OR message_id = ?1)
                   AND (?2 IS NULL OR source_id = ?2)
                   AND (?3 IS NULL OR category = ?3)
                   AND (?4 IS NULL OR received_at < ?4)"
            ),
            params![
                criteria.message_id,
                criteria.source_id,
                criteria.category,
                criteria.older_than,
            ],
        )?;
    }
    tx.commit()?;

    tracing::info!(deleted, "purged gossip");
    Ok(deleted)
}
