//! The SQLite pool every node component shares.
//!
//! The store is the only source of atomicity for sessions, credentials,
//! gossip and messages, so every pooled connection must see the same
//! database with the same pragmas applied.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Upper bound on pooled connections. Background janitors and request
    /// handlers draw from the same pool.
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The settings cannot produce a usable shared store.
    #[error("invalid database settings: {0}")]
    InvalidSettings(String),

    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

const IN_MEMORY: &str = ":memory:";

/// Applies the pragmas every node connection relies on.
///
/// WAL lets janitors read while requests write; in-memory databases report
/// `memory` instead and are accepted as is.
fn configure_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal mode stuck at {journal_mode}, expected wal")),
        ));
    }
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
}

/// Opens the node's connection pool at `db_path`.
///
/// # Arguments
///
/// * `db_path` - SQLite file; created if missing. `:memory:` is only
///   accepted with a single connection, since each in-memory connection
///   would otherwise hold its own private, empty store.
/// * `settings` - busy timeout and pool size.
///
/// # Errors
///
/// - [`PoolError::InvalidSettings`] for a zero pool size or a multi-connection
///   in-memory pool.
/// - [`PoolError::PoolInit`] if no connection can be opened and configured.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    if settings.pool_max_size == 0 {
        return Err(PoolError::InvalidSettings(
            "pool_max_size must be at least 1".to_string(),
        ));
    }
    if db_path == IN_MEMORY && settings.pool_max_size > 1 {
        return Err(PoolError::InvalidSettings(format!(
            "{IN_MEMORY} needs pool_max_size = 1, got {}",
            settings.pool_max_size
        )));
    }

    let busy_timeout_ms = settings.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| configure_connection(conn, busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;
    tracing::info!(
        path = db_path,
        max_size = settings.pool_max_size,
        busy_timeout_ms,
        "opened database pool"
    );
    Ok(pool)
}
