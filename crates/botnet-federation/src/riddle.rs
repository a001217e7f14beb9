//! Riddle pool used by the admission handshake.
//!
//! Riddles are immutable once stored; only their usage statistics change.

use crate::FederationError;
use botnet_types::time::now_millis;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Category allowed for riddles.
pub const CATEGORIES: &[&str] = &[
    "logic",
    "philosophical",
    "technical",
    "creative",
    "mathematical",
    "pattern",
];

/// Expected answer shape.
pub const EXPECTED_TYPES: &[&str] = &["reasoning", "answer", "creative"];

const FALLBACK_RIDDLE_ID: &str = "builtin-fallback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Riddle {
    pub id: String,
    pub category: String,
    pub difficulty: f64,
    pub question: String,
    pub expected_type: String,
    pub metadata: serde_json::Value,
    pub created_by: String,
    pub usage_count: i64,
    /// Fraction of finalised sessions that were accepted, 0.0 when unused.
    pub success_rate: f64,
    pub created_at: i64,
}

/// Input for [`add_riddle`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewRiddle {
    pub question: String,
    pub category: String,
    #[serde(default)]
    pub difficulty: Option<f64>,
    #[serde(default = "default_expected_type")]
    pub expected_type: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub created_by: Option<String>,
}

fn default_expected_type() -> String {
    "reasoning".to_string()
}

const RIDDLE_COLUMNS: &str = "id, category, difficulty, question, expected_type, metadata,
    created_by, usage_count, success_count, created_at";

fn row_to_riddle(row: &Row<'_>) -> rusqlite::Result<Riddle> {
    let metadata: String = row.get(5)?;
    let usage_count: i64 = row.get(7)?;
    let success_count: i64 = row.get(8)?;
    let success_rate = if usage_count > 0 {
        success_count as f64 / usage_count as f64
    } else {
        0.0
    };
    Ok(Riddle {
        id: row.get(0)?,
        category: row.get(1)?,
        difficulty: row.get(2)?,
        question: row.get(3)?,
        expected_type: row.get(4)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_by: row.get(6)?,
        usage_count,
        success_rate,
        created_at: row.get(9)?,
    })
}

pub fn get_riddle(conn: &Connection, id: &str) -> Result<Option<Riddle>, FederationError> {
    let riddle = conn
        .query_row(
            &format!("SELECT {RIDDLE_COLUMNS} FROM riddles WHERE id = ?1"),
            params![id],
            row_to_riddle,
        )
        .optional()?;
    Ok(riddle)
}

/// Picks a random riddle. An empty pool is refilled with a built-in riddle.
pub fn pick_riddle(conn: &Connection) -> Result<Riddle, FederationError> {
    let picked = conn
        .query_row(
            &format!("SELECT {RIDDLE_COLUMNS} FROM riddles ORDER BY RANDOM() LIMIT 1"),
            [],
            row_to_riddle,
        )
        .optional()?;
    if let Some(riddle) = picked {
        return Ok(riddle);
    }

    tracing::warn!("riddle pool empty, inserting built-in riddle");
    conn.execute(
        "INSERT OR IGNORE INTO riddles (id, category, difficulty, question, expected_type, metadata, created_by, created_at)
         VALUES (?1, 'logic', 0.5, ?2, 'reasoning', '{}', 'builtin', ?3)",
        params![
            FALLBACK_RIDDLE_ID,
            "Two nodes can only communicate through an unreliable channel that may drop any message. Can they ever be certain they agree on a plan? Explain your reasoning.",
            now_millis()
        ],
    )?;
    get_riddle(conn, FALLBACK_RIDDLE_ID)?
        .ok_or_else(|| FederationError::NotFound("riddle".to_string()))
}

/// Adds a riddle to the pool. Difficulty outside `0.1..=1.0` falls back to 0.5.
pub fn add_riddle(conn: &Connection, input: NewRiddle) -> Result<Riddle, FederationError> {
    let question = input.question.trim();
    if question.is_empty() {
        return Err(FederationError::Validation("question is required".to_string()));
    }
    if !CATEGORIES.contains(&input.category.as_str()) {
        return Err(FederationError::Validation(format!(
            "unknown category: {}",
            input.category
        )));
    }
    if !EXPECTED_TYPES.contains(&input.expected_type.as_str()) {
        return Err(FederationError::Validation(format!(
            "unknown expected_type: {}",
            input.expected_type
        )));
    }

    let difficulty = match input.difficulty {
        Some(d) if (0.1..=1.0).contains(&d) => d,
        _ => 0.5,
    };
    let metadata = input
        .metadata
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    let id = uuid::Uuid::new_v4().to_string();

    conn.execute(
        "INSERT INTO riddles (id, category, difficulty, question, expected_type, metadata, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            input.category,
            difficulty,
            question,
            input.expected_type,
            metadata.to_string(),
            input.created_by.as_deref().unwrap_or("operator"),
            now_millis(),
        ],
    )?;

    get_riddle(conn, &id)?.ok_or_else(|| FederationError::NotFound("riddle".to_string()))
}

/// Lists riddles, optionally filtered by category. Pages are 1-based.
pub fn list_riddles(
    conn: &Connection,
    category: Option<&str>,
    page: u32,
    page_size: u32,
) -> Result<(Vec<Riddle>, i64), FederationError> {
    let page = page.max(1);
    let page_size = page_size.clamp(1, 100);
    let offset = (page - 1) as i64 * page_size as i64;

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM riddles WHERE ?1 IS NULL OR category = ?1",
        params![category],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {RIDDLE_COLUMNS} FROM riddles
         WHERE ?1 IS NULL OR category = ?1
         ORDER BY created_at DESC, id
         LIMIT ?2 OFFSET ?3"
    ))?;
    let riddles = stmt
        .query_map(params![category, page_size, offset], row_to_riddle)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((riddles, total))
}

/// Records the outcome of a finalised session against its riddle.
pub fn record_riddle_outcome(
    conn: &Connection,
    riddle_id: &str,
    accepted: bool,
) -> Result<(), FederationError> {
    conn.execute(
        "UPDATE riddles
         SET usage_count = usage_count + 1,
             success_count = success_count + ?2
         WHERE id = ?1",
        params![riddle_id, accepted as i64],
    )?;
    Ok(())
}
