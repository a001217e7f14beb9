//! Shared types, constants, and the domain classifier for botnet nodes.
//!
//! Every crate in the workspace depends on `botnet-types` for cross-cutting
//! enums (credential tiers, lifecycle statuses, auth error codes) and for the
//! single [`classify_domain`] implementation. Status enums render to the
//! lowercase strings stored in SQLite and parse back through `FromStr`.

mod domain;
pub mod time;

pub use domain::{classify_domain, DomainClass, FEDERATION_PREFIX};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Literal source id recorded for gossip that did not come from a federated node.
pub const ANONYMOUS_SOURCE: &str = "anonymous";

/// Default confidence assigned to gossip authored by this node.
pub const SELF_CONFIDENCE: f64 = 85.0;

/// Default confidence assigned to gossip received from elsewhere.
pub const RECEIVED_CONFIDENCE: f64 = 70.0;

/// Handshake score (0-100) at or above which an answer is accepted.
pub const DEFAULT_ACCEPT_THRESHOLD: f64 = 70.0;

/// The three credential tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialTier {
    /// Minted when a friendship request is received; only checks status.
    Negotiation,
    /// Minted when a friendship becomes active; only exchangeable for sessions.
    Permanent,
    /// Minted at login; authorizes messaging and gossip.
    Session,
}

impl CredentialTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialTier::Negotiation => "negotiation",
            CredentialTier::Permanent => "permanent",
            CredentialTier::Session => "session",
        }
    }
}

impl fmt::Display for CredentialTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "negotiation" => Ok(CredentialTier::Negotiation),
            "permanent" => Ok(CredentialTier::Permanent),
            "session" => Ok(CredentialTier::Session),
            _ => Err(format!("unknown credential tier: {}", s)),
        }
    }
}

/// Machine-readable reason attached to every authentication failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthErrorCode {
    MissingAuth,
    InvalidToken,
    ExpiredToken,
    WrongTokenType,
    DomainMismatch,
}

impl AuthErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthErrorCode::MissingAuth => "MISSING_AUTH",
            AuthErrorCode::InvalidToken => "INVALID_TOKEN",
            AuthErrorCode::ExpiredToken => "EXPIRED_TOKEN",
            AuthErrorCode::WrongTokenType => "WRONG_TOKEN_TYPE",
            AuthErrorCode::DomainMismatch => "DOMAIN_MISMATCH",
        }
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an admission handshake session.
///
/// Transitions are forward-only: `Pending → Answered → {Accepted | Rejected}`,
/// with `Expired` reachable from either non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStatus {
    Pending,
    Answered,
    Accepted,
    Rejected,
    Expired,
}

impl HandshakeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeStatus::Pending => "pending",
            HandshakeStatus::Answered => "answered",
            HandshakeStatus::Accepted => "accepted",
            HandshakeStatus::Rejected => "rejected",
            HandshakeStatus::Expired => "expired",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandshakeStatus::Accepted | HandshakeStatus::Rejected | HandshakeStatus::Expired
        )
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandshakeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HandshakeStatus::Pending),
            "answered" => Ok(HandshakeStatus::Answered),
            "accepted" => Ok(HandshakeStatus::Accepted),
            "rejected" => Ok(HandshakeStatus::Rejected),
            "expired" => Ok(HandshakeStatus::Expired),
            _ => Err(format!("unknown handshake status: {}", s)),
        }
    }
}

/// Status of a bilateral friendship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendshipStatus {
    Pending,
    Active,
    Rejected,
    Blocked,
}

impl FriendshipStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FriendshipStatus::Pending => "pending",
            FriendshipStatus::Active => "active",
            FriendshipStatus::Rejected => "rejected",
            FriendshipStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for FriendshipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FriendshipStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FriendshipStatus::Pending),
            "active" => Ok(FriendshipStatus::Active),
            "rejected" => Ok(FriendshipStatus::Rejected),
            "blocked" => Ok(FriendshipStatus::Blocked),
            _ => Err(format!("unknown friendship status: {}", s)),
        }
    }
}

/// Delivery status of a direct message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    DeliveredLocally,
    SentToFederated,
    SentViaNetwork,
    Responded,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::DeliveredLocally => "delivered_locally",
            MessageStatus::SentToFederated => "sent_to_federated",
            MessageStatus::SentViaNetwork => "sent_via_network",
            MessageStatus::Responded => "responded",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "delivered_locally" => Ok(MessageStatus::DeliveredLocally),
            "sent_to_federated" => Ok(MessageStatus::SentToFederated),
            "sent_via_network" => Ok(MessageStatus::SentViaNetwork),
            "responded" => Ok(MessageStatus::Responded),
            _ => Err(format!("unknown message status: {}", s)),
        }
    }
}

/// Builds the order-independent key identifying a friendship between two domains.
pub fn domain_pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}
