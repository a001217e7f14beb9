//! Best-effort gossip among friends.
//!
//! Gossip is stored in two tables: `gossip_messages` for messages attributed
//! to a federated source domain and `anonymous_gossip` for everything from
//! non-federated origins. `message_id` is the global dedup key across both;
//! inserting a known id is a no-op reported as a duplicate.
//!
//! Exchanges are reciprocal: a peer pushing its batch receives this node's
//! most recent self-authored messages in the response.

mod error;
mod store;
mod topology;

pub use error::GossipError;
pub use store::{
    delete_messages, handle_exchange, list_recent, publish, recent_self_authored, record_source,
    DeleteCriteria, ExchangeReport, GossipMessage, IncomingGossip, NewGossip,
};
pub use topology::{network_topology, FriendSummary, NetworkTopology, TOPOLOGY_WINDOW_MS};
