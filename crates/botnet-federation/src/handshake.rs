//! Riddle-based admission handshake.
//!
//! ```text
//! pending ──answer──▶ answered ──result──▶ accepted | rejected
//!    │                    │
//!    └──── timeout ───────┴──────────────▶ expired
//! ```
//!
//! Every transition is a conditional `UPDATE ... WHERE status = ? AND
//! expires_at > now`, so concurrent submissions race on the row and exactly
//! one wins. Terminal states never change. Reads report `expired` once the
//! deadline has passed even if the stored status has not caught up yet; the
//! periodic sweep persists that and deletes old terminal sessions.

use crate::friendship::{self, Friendship};
use crate::riddle::{self, Riddle};
use crate::token::{self, IssuedCredential, TokenLifetimes};
use crate::FederationError;
use botnet_types::time::now_millis;
use botnet_types::{
    classify_domain, CredentialTier, DomainClass, FriendshipStatus, HandshakeStatus,
    DEFAULT_ACCEPT_THRESHOLD,
};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandshakeSettings {
    /// How long a session stays open, in milliseconds.
    pub session_ttl_ms: i64,
    /// Minimum score (0-100) for an accepted result to take effect.
    pub accept_threshold: f64,
    /// How long terminal sessions are kept before the sweep deletes them.
    pub retention_ms: i64,
    pub lifetimes: TokenLifetimes,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            session_ttl_ms: 5 * 60 * 1000,
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            retention_ms: 24 * 60 * 60 * 1000,
            lifetimes: TokenLifetimes::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandshakeSession {
    pub id: String,
    pub requesting_domain: String,
    pub public_key: String,
    pub node_info: serde_json::Value,
    pub riddle_id: String,
    #[serde(skip_serializing)]
    pub challenge_token: String,
    pub status: HandshakeStatus,
    #[serde(skip_serializing)]
    pub answer: Option<String>,
    pub callback_domain: Option<String>,
    pub score: Option<f64>,
    pub feedback: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
}

impl HandshakeSession {
    /// Status as observed at `now`: open sessions past their deadline read
    /// as expired.
    pub fn effective_status(&self, now: i64) -> HandshakeStatus {
        if !self.status.is_terminal() && now > self.expires_at {
            HandshakeStatus::Expired
        } else {
            self.status
        }
    }
}

/// A riddle answer submitted by the joining node.
#[derive(Debug, Clone, Deserialize)]
pub struct RiddleResponse {
    pub session_id: String,
    pub riddle_id: String,
    pub answer: String,
    pub callback_domain: String,
    pub challenge_token: String,
}

/// What finalising a session produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandshakeOutcome {
    pub session: HandshakeSession,
    pub friendship: Option<Friendship>,
    /// Permanent credential for the admitted peer; only present on accept.
    pub credential: Option<IssuedCredential>,
}

const SESSION_COLUMNS: &str = "id, requesting_domain, public_key, node_info, riddle_id,
    challenge_token, status, answer, callback_domain, score, feedback,
    created_at, updated_at, expires_at";

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<HandshakeSession> {
    let node_info: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(HandshakeSession {
        id: row.get(0)?,
        requesting_domain: row.get(1)?,
        public_key: row.get(2)?,
        node_info: serde_json::from_str(&node_info).unwrap_or(serde_json::Value::Null),
        riddle_id: row.get(4)?,
        challenge_token: row.get(5)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::<dyn std::error::Error + Send + Sync>::from(e),
            )
        })?,
        answer: row.get(7)?,
        callback_domain: row.get(8)?,
        score: row.get(9)?,
        feedback: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
        expires_at: row.get(13)?,
    })
}

fn load_session(conn: &Connection, id: &str) -> Result<Option<HandshakeSession>, FederationError> {
    let session = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM handshake_sessions WHERE id = ?1"),
            params![id],
            row_to_session,
        )
        .optional()?;
    Ok(session)
}

fn challenge_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Opens a handshake for `domain` and hands it a riddle.
pub fn start_handshake(
    conn: &Connection,
    settings: &HandshakeSettings,
    domain: &str,
    public_key: &str,
    node_info: serde_json::Value,
) -> Result<(HandshakeSession, Riddle), FederationError> {
    if classify_domain(domain) != DomainClass::Federated {
        return Err(FederationError::Validation(format!(
            "domain must be federated: {domain}"
        )));
    }
    if public_key.trim().is_empty() {
        return Err(FederationError::Validation(
            "public_key is required".to_string(),
        ));
    }

    let blocked: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM friendships WHERE peer_domain = ?1 AND status = ?2)",
        params![domain, FriendshipStatus::Blocked.as_str()],
        |row| row.get(0),
    )?;
    if blocked {
        return Err(FederationError::Forbidden(format!("{domain} is blocked")));
    }

    let riddle = riddle::pick_riddle(conn)?;
    let now = now_millis();
    let id = uuid::Uuid::new_v4().to_string();

    conn.execute(
        "INSERT INTO handshake_sessions (id, requesting_domain, public_key, node_info, riddle_id,
             challenge_token, status, created_at, updated_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7, ?8)",
        params![
            id,
            domain,
            public_key,
            node_info.to_string(),
            riddle.id,
            challenge_token(),
            now,
            now + settings.session_ttl_ms,
        ],
    )?;

    let session = load_session(conn, &id)?.ok_or(FederationError::InvalidSession)?;
    tracing::info!(session_id = %id, domain = %domain, riddle_id = %riddle.id, "handshake started");
    Ok((session, riddle))
}

/// Records the riddle answer, moving the session `pending → answered`.
///
/// Unknown sessions and any mismatch of riddle id or challenge token yield
/// [`FederationError::InvalidSession`]. A second submission, or one after the
/// deadline, yields [`FederationError::InvalidTransition`].
pub fn process_riddle_response(
    conn: &Connection,
    response: &RiddleResponse,
) -> Result<HandshakeSession, FederationError> {
    if response.answer.trim().is_empty() {
        return Err(FederationError::Validation("answer is required".to_string()));
    }
    if classify_domain(&response.callback_domain) != DomainClass::Federated {
        return Err(FederationError::Validation(format!(
            "callback_domain must be federated: {}",
            response.callback_domain
        )));
    }

    let session = load_session(conn, &response.session_id)?.ok_or(FederationError::InvalidSession)?;
    if session.riddle_id != response.riddle_id
        || session.challenge_token != response.challenge_token
    {
        tracing::debug!(session_id = %response.session_id, "handshake submission rejected");
        return Err(FederationError::InvalidSession);
    }

    let now = now_millis();
    let changed = conn.execute(
        "UPDATE handshake_sessions
         SET status = 'answered', answer = ?2, callback_domain = ?3, updated_at = ?4
         WHERE id = ?1 AND status = 'pending' AND expires_at > ?4",
        params![
            response.session_id,
            response.answer,
            response.callback_domain,
            now
        ],
    )?;
    if changed == 0 {
        return Err(FederationError::InvalidTransition(format!(
            "session is {}, not pending",
            session.effective_status(now)
        )));
    }

    tracing::info!(session_id = %response.session_id, "riddle answered");
    load_session(conn, &response.session_id)?.ok_or(FederationError::InvalidSession)
}

/// Finalises an answered session.
///
/// The result takes effect as an acceptance only when `accepted` is set and
/// `score` reaches the configured threshold. On acceptance the friendship is
/// created or activated and a permanent credential is minted, all in one
/// transaction. Finalising a session that is not `answered` (including one
/// already finalised) fails and changes nothing.
pub fn process_handshake_result(
    conn: &Connection,
    settings: &HandshakeSettings,
    node_domain: &str,
    session_id: &str,
    score: f64,
    accepted: bool,
    feedback: &str,
) -> Result<HandshakeOutcome, FederationError> {
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(FederationError::Validation(
            "score must be between 0 and 100".to_string(),
        ));
    }

    let tx = conn.unchecked_transaction()?;
    let session = load_session(&tx, session_id)?.ok_or(FederationError::InvalidSession)?;

    let accepted = accepted && score >= settings.accept_threshold;
    let status = if accepted {
        HandshakeStatus::Accepted
    } else {
        HandshakeStatus::Rejected
    };
    let now = now_millis();

    let changed = tx.execute(
        "UPDATE handshake_sessions
         SET status = ?2, score = ?3, feedback = ?4, updated_at = ?5
         WHERE id = ?1 AND status = 'answered' AND expires_at > ?5",
        params![session_id, status.as_str(), score, feedback, now],
    )?;
    if changed == 0 {
        return Err(FederationError::InvalidTransition(format!(
            "session is {}, not answered",
            session.effective_status(now)
        )));
    }

    riddle::record_riddle_outcome(&tx, &session.riddle_id, accepted)?;

    let (friendship, credential) = if accepted {
        match friendship::activate_friendship(&tx, node_domain, &session.requesting_domain, score)? {
            Some(f) => {
                let credential = token::issue_credential(
                    &tx,
                    &settings.lifetimes,
                    &session.requesting_domain,
                    CredentialTier::Permanent,
                    Some(f.id),
                )?;
                (Some(f), Some(credential))
            }
            None => {
                tracing::warn!(domain = %session.requesting_domain, "accepted handshake for blocked peer");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let session = load_session(&tx, session_id)?.ok_or(FederationError::InvalidSession)?;
    tx.commit()?;

    tracing::info!(
        session_id = %session_id,
        domain = %session.requesting_domain,
        score,
        accepted,
        "handshake finalised"
    );

    Ok(HandshakeOutcome {
        session,
        friendship,
        credential,
    })
}

/// Reads a session, reporting `expired` lazily.
pub fn get_handshake_session(
    conn: &Connection,
    id: &str,
) -> Result<HandshakeSession, FederationError> {
    let mut session = load_session(conn, id)?.ok_or(FederationError::InvalidSession)?;
    session.status = session.effective_status(now_millis());
    Ok(session)
}

/// Riddle attached to a session.
pub fn session_riddle(conn: &Connection, session: &HandshakeSession) -> Result<Riddle, FederationError> {
    riddle::get_riddle(conn, &session.riddle_id)?
        .ok_or_else(|| FederationError::NotFound(format!("riddle {}", session.riddle_id)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub deleted: usize,
}

/// Marks overdue open sessions expired and deletes terminal sessions older
/// than the retention period.
pub fn sweep_sessions(
    conn: &Connection,
    now: i64,
    retention_ms: i64,
) -> Result<SweepReport, FederationError> {
    let expired = conn.execute(
        "UPDATE handshake_sessions SET status = 'expired', updated_at = ?1
         WHERE status IN ('pending', 'answered') AND expires_at <= ?1",
        params![now],
    )?;
    let deleted = conn.execute(
        "DELETE FROM handshake_sessions
         WHERE status IN ('accepted', 'rejected', 'expired') AND updated_at < ?1",
        params![now - retention_ms],
    )?;
    Ok(SweepReport { expired, deleted })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE: &str = "botnet.home.example";
    const JOINER: &str = "botnet.new.example";

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        botnet_db::run_migrations(&conn).unwrap();
        conn
    }

    fn answer_for(session: &HandshakeSession) -> RiddleResponse {
        RiddleResponse {
            session_id: session.id.clone(),
            riddle_id: session.riddle_id.clone(),
            answer: "Because every message may be lost, certainty is impossible.".to_string(),
            callback_domain: JOINER.to_string(),
            challenge_token: session.challenge_token.clone(),
        }
    }

    #[test]
    fn start_rejects_non_federated_domains() {
        let conn = setup();
        let settings = HandshakeSettings::default();
        for bad in ["", "alice", "evil.example.com", "botnet."] {
            let err = start_handshake(&conn, &settings, bad, "pk", serde_json::json!({}))
                .unwrap_err();
            assert!(matches!(err, FederationError::Validation(_)), "{bad}");
        }
    }

    #[test]
    fn challenge_token_is_hex_and_session_pending() {
        let conn = setup();
        let (session, riddle) = start_handshake(
            &conn,
            &HandshakeSettings::default(),
            JOINER,
            "pk",
            serde_json::json!({"version": "1"}),
        )
        .unwrap();
        assert_eq!(session.status, HandshakeStatus::Pending);
        assert_eq!(session.challenge_token.len(), 32);
        assert!(session.challenge_token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(session.riddle_id, riddle.id);
        assert_eq!(session.expires_at - session.created_at, 5 * 60 * 1000);
    }

    #[test]
    fn mismatches_return_the_same_generic_error() {
        let conn = setup();
        let (session, _) = start_handshake(
            &conn,
            &HandshakeSettings::default(),
            JOINER,
            "pk",
            serde_json::json!({}),
        )
        .unwrap();

        let mut unknown = answer_for(&session);
        unknown.session_id = "nope".to_string();
        let mut wrong_token = answer_for(&session);
        wrong_token.challenge_token = "00".repeat(16);
        let mut wrong_riddle = answer_for(&session);
        wrong_riddle.riddle_id = "seed-other".to_string();

        for bad in [unknown, wrong_token, wrong_riddle] {
            let err = process_riddle_response(&conn, &bad).unwrap_err();
            assert!(matches!(err, FederationError::InvalidSession));
            assert_eq!(err.to_string(), "invalid or expired handshake session");
        }
    }

    #[test]
    fn second_answer_is_rejected() {
        let conn = setup();
        let (session, _) = start_handshake(
            &conn,
            &HandshakeSettings::default(),
            JOINER,
            "pk",
            serde_json::json!({}),
        )
        .unwrap();
        let answered = process_riddle_response(&conn, &answer_for(&session)).unwrap();
        assert_eq!(answered.status, HandshakeStatus::Answered);
        assert_eq!(answered.callback_domain.as_deref(), Some(JOINER));

        let err = process_riddle_response(&conn, &answer_for(&session)).unwrap_err();
        assert!(matches!(err, FederationError::InvalidTransition(_)));
    }

    #[test]
    fn result_before_answer_is_refused() {
        let conn = setup();
        let settings = HandshakeSettings::default();
        let (session, _) =
            start_handshake(&conn, &settings, JOINER, "pk", serde_json::json!({})).unwrap();
        let err = process_handshake_result(&conn, &settings, NODE, &session.id, 90.0, true, "")
            .unwrap_err();
        assert!(matches!(err, FederationError::InvalidTransition(_)));
    }

    #[test]
    fn low_score_is_rejected_even_if_flagged_accepted() {
        let conn = setup();
        let settings = HandshakeSettings::default();
        let (session, _) =
            start_handshake(&conn, &settings, JOINER, "pk", serde_json::json!({})).unwrap();
        process_riddle_response(&conn, &answer_for(&session)).unwrap();
        let outcome =
            process_handshake_result(&conn, &settings, NODE, &session.id, 40.0, true, "weak")
                .unwrap();
        assert_eq!(outcome.session.status, HandshakeStatus::Rejected);
        assert!(outcome.credential.is_none());
        assert!(friendship::get_friendship(&conn, NODE, JOINER).unwrap().is_none());
    }

    #[test]
    fn expired_sessions_read_as_expired_and_refuse_answers() {
        let conn = setup();
        let settings = HandshakeSettings {
            session_ttl_ms: -1,
            ..HandshakeSettings::default()
        };
        let (session, _) =
            start_handshake(&conn, &settings, JOINER, "pk", serde_json::json!({})).unwrap();

        let read = get_handshake_session(&conn, &session.id).unwrap();
        assert_eq!(read.status, HandshakeStatus::Expired);

        let err = process_riddle_response(&conn, &answer_for(&session)).unwrap_err();
        assert!(matches!(err, FederationError::InvalidTransition(_)));

        let report = sweep_sessions(&conn, now_millis(), settings.retention_ms).unwrap();
        assert_eq!(report.expired, 1);
        let stored: String = conn
            .query_row(
                "SELECT status FROM handshake_sessions WHERE id = ?1",
                params![session.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stored, "expired");

        let report = sweep_sessions(&conn, now_millis() + 1, -1_000).unwrap();
        assert_eq!(report.deleted, 1);
    }
}
