//! Bilateral friendship records, keyed by the sorted domain pair.

use crate::token::{self, IssuedCredential, TokenLifetimes};
use crate::FederationError;
use botnet_types::time::now_millis;
use botnet_types::{classify_domain, domain_pair_key, CredentialTier, DomainClass, FriendshipStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Friendship {
    pub id: i64,
    pub pair_key: String,
    pub peer_domain: String,
    pub status: FriendshipStatus,
    pub trust_score: f64,
    pub tier: CredentialTier,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_seen: Option<i64>,
}

const FRIENDSHIP_COLUMNS: &str =
    "id, pair_key, peer_domain, status, trust_score, tier, created_at, updated_at, last_seen";

fn conversion_error(idx: usize, e: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(e),
    )
}

fn row_to_friendship(row: &Row<'_>) -> rusqlite::Result<Friendship> {
    let status: String = row.get(3)?;
    let tier: String = row.get(5)?;
    Ok(Friendship {
        id: row.get(0)?,
        pair_key: row.get(1)?,
        peer_domain: row.get(2)?,
        status: status.parse().map_err(|e| conversion_error(3, e))?,
        trust_score: row.get(4)?,
        tier: tier.parse().map_err(|e| conversion_error(5, e))?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        last_seen: row.get(8)?,
    })
}

fn require_peer(node_domain: &str, peer_domain: &str) -> Result<(), FederationError> {
    if classify_domain(peer_domain) != DomainClass::Federated {
        return Err(FederationError::Validation(format!(
            "peer domain must be federated: {peer_domain}"
        )));
    }
    if peer_domain == node_domain {
        return Err(FederationError::Validation(
            "a node cannot befriend itself".to_string(),
        ));
    }
    Ok(())
}

/// Loads the friendship between this node and `peer_domain`, if any.
///
/// # Errors
///
/// Returns `FederationError::Database` on SQL failure.
pub fn get_friendship(
    conn: &Connection,
    node_domain: &str,
    peer_domain: &str,
) -> Result<Option<Friendship>, FederationError> {
    let friendship = conn
        .query_row(
            &format!("SELECT {FRIENDSHIP_COLUMNS} FROM friendships WHERE pair_key = ?1"),
            params![domain_pair_key(node_domain, peer_domain)],
            row_to_friendship,
        )
        .optional()?;
    Ok(friendship)
}

fn require_friendship(
    conn: &Connection,
    node_domain: &str,
    peer_domain: &str,
) -> Result<Friendship, FederationError> {
    get_friendship(conn, node_domain, peer_domain)?
        .ok_or_else(|| FederationError::NotFound(format!("friendship with {peer_domain}")))
}

/// Records an inbound friendship request and mints a negotiation token for
/// the requester.
///
/// A repeat request mints another negotiation token and leaves earlier ones
/// as they were; they lapse on their own expiry. Blocked peers and
/// already-active friendships are refused.
///
/// # Errors
///
/// - [`FederationError::Validation`] if `peer_domain` is not a federated
///   name or is this node's own domain.
/// - [`FederationError::Forbidden`] if the peer is blocked.
/// - [`FederationError::InvalidTransition`] if the friendship is already active.
pub fn request_friendship(
    conn: &Connection,
    lifetimes: &TokenLifetimes,
    node_domain: &str,
    peer_domain: &str,
) -> Result<(Friendship, IssuedCredential), FederationError> {
    require_peer(node_domain, peer_domain)?;

    let tx = conn.unchecked_transaction()?;
    match get_friendship(&tx, node_domain, peer_domain)? {
        Some(f) if f.status == FriendshipStatus::Blocked => {
            return Err(FederationError::Forbidden(format!("{peer_domain} is blocked")));
        }
        Some(f) if f.status == FriendshipStatus::Active => {
            return Err(FederationError::InvalidTransition(format!(
                "friendship with {peer_domain} is already active"
            )));
        }
        _ => {}
    }

    let now = now_millis();
    tx.execute(
        "INSERT INTO friendships (pair_key, peer_domain, status, tier, created_at, updated_at)
         VALUES (?1, ?2, 'pending', 'negotiation', ?3, ?3)
         ON CONFLICT(pair_key) DO UPDATE SET
             status = 'pending',
             tier = 'negotiation',
             updated_at = excluded.updated_at",
        params![domain_pair_key(node_domain, peer_domain), peer_domain, now],
    )?;

    let friendship = require_friendship(&tx, node_domain, peer_domain)?;
    let credential = token::issue_credential(
        &tx,
        lifetimes,
        peer_domain,
        CredentialTier::Negotiation,
        Some(friendship.id),
    )?;
    tx.commit()?;

    tracing::info!(peer = %peer_domain, "friendship requested");
    Ok((friendship, credential))
}

/// Creates or activates the friendship after a successful handshake.
///
/// Returns `None` without changing anything when the peer is blocked.
pub fn activate_friendship(
    conn: &Connection,
    node_domain: &str,
    peer_domain: &str,
    trust_score: f64,
) -> Result<Option<Friendship>, FederationError> {
    require_peer(node_domain, peer_domain)?;
    let now = now_millis();
    let changed = conn.execute(
        "INSERT INTO friendships (pair_key, peer_domain, status, trust_score, tier, created_at, updated_at, last_seen)
         VALUES (?1, ?2, 'active', ?3, 'permanent', ?4, ?4, ?4)
         ON CONFLICT(pair_key) DO UPDATE SET
             status = 'active',
             trust_score = excluded.trust_score,
             tier = 'permanent',
             updated_at = excluded.updated_at,
             last_seen = excluded.last_seen
         WHERE friendships.status != 'blocked'",
        params![
            domain_pair_key(node_domain, peer_domain),
            peer_domain,
            trust_score.clamp(0.0, 100.0),
            now
        ],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    get_friendship(conn, node_domain, peer_domain)
}

fn transition(
    conn: &Connection,
    node_domain: &str,
    peer_domain: &str,
    to: FriendshipStatus,
    allowed_from: &[FriendshipStatus],
) -> Result<Friendship, FederationError> {
    let current = require_friendship(conn, node_domain, peer_domain)?;
    if !allowed_from.contains(&current.status) {
        return Err(FederationError::InvalidTransition(format!(
            "friendship with {peer_domain} is {}, cannot become {to}",
            current.status
        )));
    }
    let tier = if to == FriendshipStatus::Active {
        CredentialTier::Permanent
    } else {
        current.tier
    };
    conn.execute(
        "UPDATE friendships SET status = ?2, tier = ?3, updated_at = ?4 WHERE id = ?1",
        params![current.id, to.as_str(), tier.as_str(), now_millis()],
    )?;
    require_friendship(conn, node_domain, peer_domain)
}

/// Operator acceptance of a pending (or previously rejected) request.
///
/// The requester collects its permanent credential by presenting the
/// negotiation token to `friendship.status`.
///
/// # Errors
///
/// - [`FederationError::NotFound`] if no request from the peer exists.
/// - [`FederationError::InvalidTransition`] unless the friendship is pending
///   or rejected.
pub fn accept_friendship(
    conn: &Connection,
    node_domain: &str,
    peer_domain: &str,
) -> Result<Friendship, FederationError> {
    let friendship = transition(
        conn,
        node_domain,
        peer_domain,
        FriendshipStatus::Active,
        &[FriendshipStatus::Pending, FriendshipStatus::Rejected],
    )?;
    tracing::info!(peer = %peer_domain, "friendship accepted");
    Ok(friendship)
}

/// Rejects a friendship and revokes every credential issued to the peer.
pub fn reject_friendship(
    conn: &Connection,
    node_domain: &str,
    peer_domain: &str,
) -> Result<Friendship, FederationError> {
    let tx = conn.unchecked_transaction()?;
    let friendship = transition(
        &tx,
        node_domain,
        peer_domain,
        FriendshipStatus::Rejected,
        &[FriendshipStatus::Pending, FriendshipStatus::Active],
    )?;
    token::revoke_for_domain(&tx, peer_domain, None)?;
    tx.commit()?;
    tracing::info!(peer = %peer_domain, "friendship rejected");
    Ok(friendship)
}

/// Blocks a peer from any state, creating the record if needed, and revokes
/// every credential issued to it.
pub fn block_friendship(
    conn: &Connection,
    node_domain: &str,
    peer_domain: &str,
) -> Result<Friendship, FederationError> {
    require_peer(node_domain, peer_domain)?;
    let tx = conn.unchecked_transaction()?;
    let now = now_millis();
    tx.execute(
        "INSERT INTO friendships (pair_key, peer_domain, status, tier, created_at, updated_at)
         VALUES (?1, ?2, 'blocked', 'negotiation', ?3, ?3)
         ON CONFLICT(pair_key) DO UPDATE SET status = 'blocked', updated_at = excluded.updated_at",
        params![domain_pair_key(node_domain, peer_domain), peer_domain, now],
    )?;
    token::revoke_for_domain(&tx, peer_domain, None)?;
    let friendship = require_friendship(&tx, node_domain, peer_domain)?;
    tx.commit()?;
    tracing::warn!(peer = %peer_domain, "peer blocked");
    Ok(friendship)
}

/// Friendships of this node, optionally filtered by status.
pub fn list_friendships(
    conn: &Connection,
    status: Option<FriendshipStatus>,
) -> Result<Vec<Friendship>, FederationError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FRIENDSHIP_COLUMNS} FROM friendships
         WHERE ?1 IS NULL OR status = ?1
         ORDER BY updated_at DESC, id"
    ))?;
    let rows = stmt
        .query_map(params![status.map(|s| s.as_str())], row_to_friendship)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Domains of every active friend.
pub fn active_peers(conn: &Connection) -> Result<Vec<String>, FederationError> {
    Ok(list_friendships(conn, Some(FriendshipStatus::Active))?
        .into_iter()
        .map(|f| f.peer_domain)
        .collect())
}

/// Refreshes `last_seen`. Returns whether a friendship record exists.
pub fn touch_last_seen(
    conn: &Connection,
    node_domain: &str,
    peer_domain: &str,
) -> Result<bool, FederationError> {
    let changed = conn.execute(
        "UPDATE friendships SET last_seen = ?2 WHERE pair_key = ?1",
        params![domain_pair_key(node_domain, peer_domain), now_millis()],
    )?;
    Ok(changed > 0)
}
