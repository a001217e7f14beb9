//! Database layer for botnet nodes.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations. Every table a node persists (handshake
//! sessions, riddles, credentials, friendships, gossip, direct messages) is
//! created through the versioned migrations in this crate.
//!
//! SQLite is the sole authority for atomicity: deduplication relies on
//! `INSERT OR IGNORE`, and forward-only status transitions rely on
//! conditional `UPDATE ... WHERE status = ?` statements checked by row count.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
