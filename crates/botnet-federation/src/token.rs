//! Three-tier credential issuance and validation.
//!
//! | Tier | Scope | Lifetime |
//! |---|---|---|
//! | negotiation | check friendship status for one domain pair | 24h |
//! | permanent | exchange for session tokens | no expiry, revocable |
//! | session | messaging and gossip | 4h |
//!
//! Token strings are 32 random bytes, hex encoded. Only the SHA-256 digest is
//! persisted; the tier is read back from the stored row and never inferred
//! from the token's shape. Issuing a token never mutates another token's row,
//! except that a new permanent credential revokes the previous live one for
//! the same subject.

use crate::friendship::{self, Friendship};
use crate::FederationError;
use botnet_types::time::now_millis;
use botnet_types::{AuthErrorCode, CredentialTier, FriendshipStatus};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const HOUR_MS: i64 = 60 * 60 * 1000;

/// Credential lifetimes in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLifetimes {
    pub negotiation_ms: i64,
    pub session_ms: i64,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            negotiation_ms: 24 * HOUR_MS,
            session_ms: 4 * HOUR_MS,
        }
    }
}

impl TokenLifetimes {
    fn expiry_for(&self, tier: CredentialTier, now: i64) -> Option<i64> {
        match tier {
            CredentialTier::Negotiation => Some(now + self.negotiation_ms),
            CredentialTier::Session => Some(now + self.session_ms),
            CredentialTier::Permanent => None,
        }
    }
}

/// A freshly minted credential. `token` is the only copy of the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub token_id: String,
    pub token: String,
    pub tier: CredentialTier,
    pub subject_domain: String,
    pub issued_at: i64,
    pub expires_at: Option<i64>,
}

/// Result of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResult {
    pub authenticated: bool,
    pub domain: Option<String>,
    pub tier: Option<CredentialTier>,
    pub token_id: Option<String>,
    pub error_code: Option<AuthErrorCode>,
}

impl AuthResult {
    fn failed(code: AuthErrorCode) -> Self {
        Self {
            authenticated: false,
            domain: None,
            tier: None,
            token_id: None,
            error_code: Some(code),
        }
    }

    /// Converts a failed result into [`FederationError::Auth`].
    pub fn into_result(self) -> Result<AuthResult, FederationError> {
        match self.error_code {
            Some(code) => Err(FederationError::Auth(code)),
            None => Ok(self),
        }
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Mints a credential of `tier` for `subject_domain`.
///
/// Issuance only inserts a row. Earlier credentials of the same subject stay
/// exactly as they were; replacing one is an explicit call to
/// [`revoke_for_domain`] or [`revoke_token_id`].
///
/// # Errors
///
/// Returns [`FederationError::Database`] if the insert fails.
pub fn issue_credential(
    conn: &Connection,
    lifetimes: &TokenLifetimes,
    subject_domain: &str,
    tier: CredentialTier,
    friendship_id: Option<i64>,
) -> Result<IssuedCredential, FederationError> {
    let now = now_millis();
    let token = generate_token();
    let token_id = uuid::Uuid::new_v4().to_string();
    let expires_at = lifetimes.expiry_for(tier, now);

    conn.execute(
        "INSERT INTO credentials (token_id, token_hash, subject_domain, tier, issued_at, expires_at, friendship_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            token_id,
            hash_token(&token),
            subject_domain,
            tier.as_str(),
            now,
            expires_at,
            friendship_id,
        ],
    )?;

    tracing::debug!(domain = %subject_domain, tier = %tier, token_id = %token_id, "issued credential");

    Ok(IssuedCredential {
        token_id,
        token,
        tier,
        subject_domain: subject_domain.to_string(),
        issued_at: now,
        expires_at,
    })
}

struct StoredCredential {
    token_id: String,
    subject_domain: String,
    tier: String,
    expires_at: Option<i64>,
    revoked: bool,
}

fn lookup(conn: &Connection, token: &str) -> Result<Option<StoredCredential>, FederationError> {
    let stored = conn
        .query_row(
            "SELECT token_id, subject_domain, tier, expires_at, revoked
             FROM credentials WHERE token_hash = ?1",
            params![hash_token(token)],
            |row| {
                Ok(StoredCredential {
                    token_id: row.get(0)?,
                    subject_domain: row.get(1)?,
                    tier: row.get(2)?,
                    expires_at: row.get(3)?,
                    revoked: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(stored)
}

/// Validates `token` against `required` tier and, when given, the domain the
/// caller claims to act for.
///
/// Tier matching is exact: a permanent credential does not satisfy a
/// session-tier method and vice versa.
///
/// A refused token is not an error: the result carries `authenticated =
/// false` and the [`AuthErrorCode`] naming why.
///
/// # Errors
///
/// Returns `FederationError::Database` on SQL failure.
pub fn validate(
    conn: &Connection,
    token: Option<&str>,
    required: CredentialTier,
    requested_domain: Option<&str>,
) -> Result<AuthResult, FederationError> {
    let token = match token.map(str::trim) {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(AuthResult::failed(AuthErrorCode::MissingAuth)),
    };

    let stored = match lookup(conn, token)? {
        Some(stored) if !stored.revoked => stored,
        _ => return Ok(AuthResult::failed(AuthErrorCode::InvalidToken)),
    };

    if let Some(expires_at) = stored.expires_at {
        if now_millis() >= expires_at {
            return Ok(AuthResult::failed(AuthErrorCode::ExpiredToken));
        }
    }

    let tier: CredentialTier = match stored.tier.parse() {
        Ok(tier) => tier,
        Err(_) => return Ok(AuthResult::failed(AuthErrorCode::InvalidToken)),
    };
    if tier != required {
        return Ok(AuthResult::failed(AuthErrorCode::WrongTokenType));
    }

    if let Some(domain) = requested_domain {
        if domain != stored.subject_domain {
            return Ok(AuthResult::failed(AuthErrorCode::DomainMismatch));
        }
    }

    Ok(AuthResult {
        authenticated: true,
        domain: Some(stored.subject_domain),
        tier: Some(tier),
        token_id: Some(stored.token_id),
        error_code: None,
    })
}

/// Exchanges a permanent credential for a new session token.
///
/// Fails with [`FederationError::Auth`] and mints nothing when the permanent
/// credential is missing, unknown, revoked or bound to another domain.
/// Concurrent logins each receive a distinct session token.
pub fn login(
    conn: &Connection,
    lifetimes: &TokenLifetimes,
    permanent_token: Option<&str>,
    claimed_domain: Option<&str>,
) -> Result<IssuedCredential, FederationError> {
    let auth = validate(conn, permanent_token, CredentialTier::Permanent, claimed_domain)?
        .into_result()?;
    let domain = auth
        .domain
        .ok_or(FederationError::Auth(AuthErrorCode::InvalidToken))?;

    let friendship_id: Option<i64> = conn
        .query_row(
            "SELECT friendship_id FROM credentials WHERE token_id = ?1",
            params![auth.token_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let session = issue_credential(
        conn,
        lifetimes,
        &domain,
        CredentialTier::Session,
        friendship_id,
    )?;
    tracing::info!(domain = %domain, token_id = %session.token_id, "session login");
    Ok(session)
}

/// Result of presenting a negotiation token to check friendship status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NegotiationStatus {
    pub friendship: Friendship,
    /// Present exactly once: on the first check after the friendship became
    /// active.
    pub credential: Option<IssuedCredential>,
}

/// Reports the friendship status for the negotiation token's subject and,
/// the first time the friendship is seen active, consumes the token and
/// mints the permanent credential.
pub fn exchange_negotiation_token(
    conn: &Connection,
    lifetimes: &TokenLifetimes,
    node_domain: &str,
    token: Option<&str>,
    requested_domain: Option<&str>,
) -> Result<NegotiationStatus, FederationError> {
    let auth = validate(conn, token, CredentialTier::Negotiation, requested_domain)?
        .into_result()?;
    let (Some(domain), Some(token_id)) = (auth.domain, auth.token_id) else {
        return Err(FederationError::Auth(AuthErrorCode::InvalidToken));
    };

    let tx = conn.unchecked_transaction()?;
    let friendship = friendship::get_friendship(&tx, node_domain, &domain)?
        .ok_or_else(|| FederationError::NotFound(format!("friendship with {domain}")))?;

    if friendship.status != FriendshipStatus::Active {
        tx.commit()?;
        return Ok(NegotiationStatus {
            friendship,
            credential: None,
        });
    }

    let consumed = tx.execute(
        "UPDATE credentials SET consumed_at = ?2
         WHERE token_id = ?1 AND consumed_at IS NULL",
        params![token_id, now_millis()],
    )?;

    let credential = if consumed == 1 {
        let issued = issue_credential(
            &tx,
            lifetimes,
            &domain,
            CredentialTier::Permanent,
            Some(friendship.id),
        )?;
        tracing::info!(domain = %domain, "negotiation token exchanged for permanent credential");
        Some(issued)
    } else {
        None
    };
    tx.commit()?;

    Ok(NegotiationStatus {
        friendship,
        credential,
    })
}

/// Revokes credentials for a domain, optionally restricted to one tier.
///
/// Sessions are included, so a caller holding a session minted from a
/// revoked permanent credential is locked out as well. Returns the number
/// of rows revoked.
pub fn revoke_for_domain(
    conn: &Connection,
    domain: &str,
    tier: Option<CredentialTier>,
) -> Result<usize, FederationError> {
    let revoked = conn.execute(
        "UPDATE credentials SET revoked = 1
         WHERE subject_domain = ?1 AND revoked = 0 AND (?2 IS NULL OR tier = ?2)",
        params![domain, tier.map(|t| t.as_str())],
    )?;
    if revoked > 0 {
        tracing::info!(domain = %domain, revoked, "revoked credentials");
    }
    Ok(revoked)
}

/// Revokes a single credential by id. Returns whether a live row changed.
pub fn revoke_token_id(conn: &Connection, token_id: &str) -> Result<bool, FederationError> {
    let changed = conn.execute(
        "UPDATE credentials SET revoked = 1 WHERE token_id = ?1 AND revoked = 0",
        params![token_id],
    )?;
    Ok(changed == 1)
}

/// Deletes negotiation and session rows that expired before `now`.
/// Permanent credentials are never purged.
pub fn purge_expired(conn: &Connection, now: i64) -> Result<usize, FederationError> {
    let purged = conn.execute(
        "DELETE FROM credentials
         WHERE tier IN ('negotiation', 'session')
           AND expires_at IS NOT NULL AND expires_at < ?1",
        params![now],
    )?;
    Ok(purged)
}
