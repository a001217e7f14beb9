use crate::GossipError;
use botnet_federation::friendship;
use botnet_types::FriendshipStatus;
use rusqlite::{params, Connection};
use serde::Serialize;

/// Width of the rolling statistics window.
pub const TOPOLOGY_WINDOW_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FriendSummary {
    pub domain: String,
    pub trust_score: f64,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkTopology {
    pub node_domain: String,
    pub friends: Vec<FriendSummary>,
    pub window_start: i64,
    pub total_messages: i64,
    pub unique_sources: i64,
    /// `None` when no gossip arrived inside the window.
    pub average_confidence: Option<f64>,
}

/// Active friendships plus gossip statistics for the last seven days.
pub fn network_topology(
    conn: &Connection,
    node_domain: &str,
    now: i64,
) -> Result<NetworkTopology, GossipError> {
    let friends = friendship::list_friendships(conn, Some(FriendshipStatus::Active))?
        .into_iter()
        .map(|f| FriendSummary {
            domain: f.peer_domain,
            trust_score: f.trust_score,
            last_seen: f.last_seen,
        })
        .collect();

    let window_start = now - TOPOLOGY_WINDOW_MS;
    let (total_messages, unique_sources, average_confidence) = conn.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT source_id), AVG(confidence_score)
         FROM (
             SELECT source_id, confidence_score, received_at FROM gossip_messages
             UNION ALL
             SELECT source_id, confidence_score, received_at FROM anonymous_gossip
         )
         WHERE received_at >= ?1",
        params![window_start],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    Ok(NetworkTopology {
        node_domain: node_domain.to_string(),
        friends,
        window_start,
        total_messages,
        unique_sources,
        average_confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handle_exchange, IncomingGossip};
    use botnet_types::time::now_millis;

    const NODE: &str = "botnet.home.example";

    #[test]
    fn empty_network_has_no_average() {
        let conn = Connection::open_in_memory().unwrap();
        botnet_db::run_migrations(&conn).unwrap();
        let topology = network_topology(&conn, NODE, now_millis()).unwrap();
        assert!(topology.friends.is_empty());
        assert_eq!(topology.total_messages, 0);
        assert_eq!(topology.average_confidence, None);
    }

    #[test]
    fn old_gossip_falls_outside_the_window() {
        let conn = Connection::open_in_memory().unwrap();
        botnet_db::run_migrations(&conn).unwrap();
        let msg = IncomingGossip {
            message_id: "m1".to_string(),
            content: "x".to_string(),
            category: None,
            confidence_score: Some(60.0),
            metadata: None,
            created_at: None,
        };
        handle_exchange(&conn, NODE, "botnet.peer.example", &[msg], 5).unwrap();

        let now = now_millis();
        assert_eq!(network_topology(&conn, NODE, now).unwrap().total_messages, 1);
        let later = now + TOPOLOGY_WINDOW_MS + 60_000;
        assert_eq!(network_topology(&conn, NODE, later).unwrap().total_messages, 0);
    }
}
