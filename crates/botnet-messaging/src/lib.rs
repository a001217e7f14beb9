//! Direct messages between local and federated domains.
//!
//! A message is persisted as `pending` and then resolved by the routing
//! matrix of its sender and recipient classes:
//!
//! | from \ to | local | federated |
//! |---|---|---|
//! | local | `delivered_locally` | `sent_to_federated` (requires manual check) |
//! | federated | `delivered_locally` | `sent_via_network` |
//!
//! Responses to messages sent to federated domains are collected by polling
//! the target node; this crate provides the grouping and ingestion halves of
//! that loop, the network half lives in the server.

mod error;
mod router;

pub use error::MessageError;
pub use router::{
    check_responses, delete_messages, get_message, ingest_responses, pending_federated,
    resolve_status, review_messages, send_message, set_response, DeleteCriteria, Message,
    MessageMetadata, MessageResponse, Review, ReviewedMessage, SendRequest,
};
