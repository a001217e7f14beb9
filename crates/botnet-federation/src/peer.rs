//! Credentials and handshakes this node holds against remote peers.
//!
//! Unlike [`crate::token`], these tokens are stored in the clear: the node
//! has to present them on outbound calls.

use crate::FederationError;
use botnet_types::time::now_millis;
use botnet_types::{CredentialTier, HandshakeStatus};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCredential {
    pub peer_domain: String,
    pub tier: CredentialTier,
    pub token: String,
    pub expires_at: Option<i64>,
}

/// Stores (or replaces) the credential of `tier` held for `peer_domain`.
pub fn store_peer_credential(
    conn: &Connection,
    peer_domain: &str,
    tier: CredentialTier,
    token: &str,
    expires_at: Option<i64>,
) -> Result<(), FederationError> {
    conn.execute(
        "INSERT INTO peer_credentials (peer_domain, tier, token, expires_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(peer_domain, tier) DO UPDATE SET
             token = excluded.token,
             expires_at = excluded.expires_at,
             updated_at = excluded.updated_at",
        params![peer_domain, tier.as_str(), token, expires_at, now_millis()],
    )?;
    tracing::debug!(peer = %peer_domain, tier = %tier, "stored peer credential");
    Ok(())
}

/// Returns the live credential of `tier` for `peer_domain`, ignoring
/// expired rows.
pub fn get_peer_credential(
    conn: &Connection,
    peer_domain: &str,
    tier: CredentialTier,
) -> Result<Option<PeerCredential>, FederationError> {
    let credential = conn
        .query_row(
            "SELECT token, expires_at FROM peer_credentials
             WHERE peer_domain = ?1 AND tier = ?2
               AND (expires_at IS NULL OR expires_at > ?3)",
            params![peer_domain, tier.as_str(), now_millis()],
            |row| {
                Ok(PeerCredential {
                    peer_domain: peer_domain.to_string(),
                    tier,
                    token: row.get(0)?,
                    expires_at: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(credential)
}

pub fn delete_peer_credential(
    conn: &Connection,
    peer_domain: &str,
    tier: CredentialTier,
) -> Result<bool, FederationError> {
    let deleted = conn.execute(
        "DELETE FROM peer_credentials WHERE peer_domain = ?1 AND tier = ?2",
        params![peer_domain, tier.as_str()],
    )?;
    Ok(deleted > 0)
}

/// A handshake this node started against a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundHandshake {
    pub session_id: String,
    pub peer_domain: String,
    pub riddle_id: String,
    pub question: String,
    #[serde(skip_serializing)]
    pub challenge_token: String,
    pub status: HandshakeStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub completed_at: Option<i64>,
}

pub fn record_outbound_handshake(
    conn: &Connection,
    handshake: &OutboundHandshake,
) -> Result<(), FederationError> {
    conn.execute(
        "INSERT INTO outbound_handshakes (session_id, peer_domain, riddle_id, question,
             challenge_token, status, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            handshake.session_id,
            handshake.peer_domain,
            handshake.riddle_id,
            handshake.question,
            handshake.challenge_token,
            handshake.status.as_str(),
            handshake.created_at,
            handshake.expires_at,
        ],
    )?;
    Ok(())
}

/// Latest outbound handshake with `peer_domain`.
///
/// # Errors
///
/// Returns `FederationError::Database` on SQL failure.
pub fn get_outbound_handshake(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<OutboundHandshake>, FederationError> {
    let handshake = conn
        .query_row(
            "SELECT session_id, peer_domain, riddle_id, question, challenge_token, status,
                    created_at, expires_at, completed_at
             FROM outbound_handshakes WHERE session_id = ?1",
            params![session_id],
            |row| {
                let status: String = row.get(5)?;
                Ok(OutboundHandshake {
                    session_id: row.get(0)?,
                    peer_domain: row.get(1)?,
                    riddle_id: row.get(2)?,
                    question: row.get(3)?,
                    challenge_token: row.get(4)?,
                    status: status.parse().map_err(|e: String| {
                        rusqlite::Error::FromSqlConversionFailure(
                            5,
                            rusqlite::types::Type::Text,
                            Box::<dyn std::error::Error + Send + Sync>::from(e),
                        )
                    })?,
                    created_at: row.get(6)?,
                    expires_at: row.get(7)?,
                    completed_at: row.get(8)?,
                })
            },
        )
        .optional()?;
    Ok(handshake)
}

/// Moves an outbound handshake from one of `from` to `to`. Returns whether
/// the row changed.
pub fn advance_outbound_handshake(
    conn: &Connection,
    session_id: &str,
    from: &[HandshakeStatus],
    to: HandshakeStatus,
) -> Result<bool, FederationError> {
    let now = now_millis();
    let completed_at = to.is_terminal().then_some(now);
    let mut changed = 0;
    for status in from {
        changed += conn.execute(
            "UPDATE outbound_handshakes SET status = ?3, completed_at = ?4
             WHERE session_id = ?1 AND status = ?2",
            params![session_id, status.as_str(), to.as_str(), completed_at],
        )?;
        if changed > 0 {
            break;
        }
    }
    Ok(changed > 0)
}

/// Records the outcome a peer reported for one of our handshakes.
///
/// The permanent credential is stored only when `session_id` names an open
/// outbound handshake with `peer_domain`. Returns whether it matched.
pub fn accept_handshake_result(
    conn: &Connection,
    peer_domain: &str,
    session_id: &str,
    accepted: bool,
    permanent_token: Option<&str>,
) -> Result<bool, FederationError> {
    let tx = conn.unchecked_transaction()?;
    let Some(handshake) = get_outbound_handshake(&tx, session_id)? else {
        return Ok(false);
    };
    if handshake.peer_domain != peer_domain {
        return Ok(false);
    }

    let to = if accepted {
        HandshakeStatus::Accepted
    } else {
        HandshakeStatus::Rejected
    };
    let advanced = advance_outbound_handshake(
        &tx,
        session_id,
        &[HandshakeStatus::Pending, HandshakeStatus::Answered],
        to,
    )?;
    if !advanced {
        return Ok(false);
    }

    if accepted {
        if let Some(token) = permanent_token.filter(|t| !t.is_empty()) {
            store_peer_credential(&tx, peer_domain, CredentialTier::Permanent, token, None)?;
            delete_peer_credential(&tx, peer_domain, CredentialTier::Session)?;
        }
    }
    tx.commit()?;

    tracing::info!(peer = %peer_domain, session_id = %session_id, accepted, "outbound handshake finalised");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "botnet.peer.example";

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        botnet_db::run_migrations(&conn).unwrap();
        conn
    }

    fn outbound(session_id: &str) -> OutboundHandshake {
        let now = now_millis();
        OutboundHandshake {
            session_id: session_id.to_string(),
            peer_domain: PEER.to_string(),
            riddle_id: "seed-logic-001".to_string(),
            question: "q".to_string(),
            challenge_token: "ab".repeat(16),
            status: HandshakeStatus::Pending,
            created_at: now,
            expires_at: now + 60_000,
            completed_at: None,
        }
    }

    #[test]
    fn expired_peer_credentials_are_hidden() {
        let conn = setup();
        store_peer_credential(&conn, PEER, CredentialTier::Session, "s1", Some(0)).unwrap();
        assert!(get_peer_credential(&conn, PEER, CredentialTier::Session)
            .unwrap()
            .is_none());

        store_peer_credential(&conn, PEER, CredentialTier::Session, "s2", None).unwrap();
        let live = get_peer_credential(&conn, PEER, CredentialTier::Session)
            .unwrap()
            .unwrap();
        assert_eq!(live.token, "s2");
    }

    #[test]
    fn result_for_unknown_session_stores_nothing() {
        let conn = setup();
        let matched = accept_handshake_result(&conn, PEER, "unknown", true, Some("perm")).unwrap();
        assert!(!matched);
        assert!(get_peer_credential(&conn, PEER, CredentialTier::Permanent)
            .unwrap()
            .is_none());
    }

    #[test]
    fn result_from_the_wrong_peer_is_ignored() {
        let conn = setup();
        record_outbound_handshake(&conn, &outbound("s-1")).unwrap();
        let matched =
            accept_handshake_result(&conn, "botnet.other.example", "s-1", true, Some("perm"))
                .unwrap();
        assert!(!matched);
    }

    #[test]
    fn matching_result_stores_the_permanent_credential_once() {
        let conn = setup();
        record_outbound_handshake(&conn, &outbound("s-2")).unwrap();
        assert!(accept_handshake_result(&conn, PEER, "s-2", true, Some("perm")).unwrap());
        let stored = get_peer_credential(&conn, PEER, CredentialTier::Permanent)
            .unwrap()
            .unwrap();
        assert_eq!(stored.token, "perm");

        // A replayed result cannot overwrite it.
        assert!(!accept_handshake_result(&conn, PEER, "s-2", true, Some("other")).unwrap());
        let stored = get_peer_credential(&conn, PEER, CredentialTier::Permanent)
            .unwrap()
            .unwrap();
        assert_eq!(stored.token, "perm");

        let handshake = get_outbound_handshake(&conn, "s-2").unwrap().unwrap();
        assert_eq!(handshake.status, HandshakeStatus::Accepted);
        assert!(handshake.completed_at.is_some());
    }
}
