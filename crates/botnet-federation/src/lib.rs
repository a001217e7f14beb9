//! Admission and trust for botnet nodes.
//!
//! This crate owns everything that decides *who* a node talks to:
//!
//! - [`handshake`]: the riddle-based admission protocol. Sessions move
//!   forward only (`pending → answered → accepted | rejected`), and expire
//!   after a fixed lifetime regardless of stored status.
//! - [`judge`]: scoring of riddle answers, either deferred to an external
//!   evaluator or computed locally by a heuristic.
//! - [`token`]: the three credential tiers (negotiation, permanent, session).
//!   Token strings are random; only their SHA-256 digests are stored and the
//!   tier always comes from the stored row.
//! - [`friendship`]: bilateral friendship records keyed by domain pair.
//! - [`signature`]: Ed25519 signatures agents put on outgoing messages.
//! - [`peer`]: credentials and outbound handshakes this node holds *for*
//!   remote peers.
//!
//! All functions take a `&rusqlite::Connection` and rely on SQLite for
//! atomicity; callers run them inside `spawn_blocking`.

pub mod error;
pub mod friendship;
pub mod handshake;
pub mod judge;
pub mod peer;
pub mod riddle;
pub mod signature;
pub mod token;

pub use error::FederationError;
pub use friendship::Friendship;
pub use handshake::{HandshakeOutcome, HandshakeSession, HandshakeSettings, RiddleResponse};
pub use judge::{ExternalJudge, HeuristicJudge, JudgeMode, RiddleJudge, Verdict};
pub use riddle::{NewRiddle, Riddle};
pub use token::{AuthResult, IssuedCredential, TokenLifetimes};
