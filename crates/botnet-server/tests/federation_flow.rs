//! Two nodes on real sockets: admission through the heuristic judge, then
//! message forwarding, response polling and gossip push between them.

mod common;

use axum::Router;
use botnet_db::DbPool;
use botnet_federation::JudgeMode;
use botnet_server::background::push_gossip;
use botnet_server::{app, AppState};
use common::{
    bind, dead_url, eventually, ok, operator_key, rpc, serve, signed_send, test_config, test_state,
    Auth, OPERATOR,
};
use serde_json::json;
use tempfile::NamedTempFile;

const ALPHA: &str = "botnet.alpha";
const BETA: &str = "botnet.beta";
const GAMMA: &str = "botnet.gamma";

const GOOD_ANSWER: &str = "Consider the question carefully. My analysis starts from the evidence \
at hand. Because each node in a distributed network follows the same protocol, consensus can \
emerge from purely local rules. However, the system only converges when messages are delivered \
reliably. Therefore my reasoning leads to one conclusion: agreement belongs to the whole network, \
not to any single participant.";

struct Node {
    _db: NamedTempFile,
    state: AppState,
    app: Router,
}

impl Node {
    fn pool(&self) -> &DbPool {
        &self.state.pool
    }
}

struct Federation {
    alpha: Node,
    beta: Node,
}

fn count(pool: &DbPool, sql: &str, param: &str) -> i64 {
    let conn = pool.get().unwrap();
    conn.query_row(sql, [param], |row| row.get(0)).unwrap()
}

/// Starts both nodes and has alpha join beta.
async fn federate() -> Federation {
    let (alpha_listener, alpha_url) = bind().await;
    let (beta_listener, beta_url) = bind().await;
    let gamma_url = dead_url().await;

    let mut alpha_config = test_config(ALPHA);
    alpha_config
        .federation
        .peer_urls
        .insert(BETA.to_string(), beta_url);
    alpha_config
        .federation
        .peer_urls
        .insert(GAMMA.to_string(), gamma_url);
    let mut beta_config = test_config(BETA);
    beta_config.handshake.judge = JudgeMode::Heuristic;
    beta_config
        .federation
        .peer_urls
        .insert(ALPHA.to_string(), alpha_url);

    let (alpha_db, alpha_state) = test_state(alpha_config);
    let (beta_db, beta_state) = test_state(beta_config);
    serve(alpha_listener, alpha_state.clone());
    serve(beta_listener, beta_state.clone());

    let alpha = Node {
        _db: alpha_db,
        app: app(alpha_state.clone()),
        state: alpha_state,
    };
    let beta = Node {
        _db: beta_db,
        app: app(beta_state.clone()),
        state: beta_state,
    };

    let joined = rpc(
        &alpha.app,
        "handshake.join",
        json!({ "peer_domain": BETA }),
        Auth::Agent,
    )
    .await;
    let session_id = ok(&joined)["session"]["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(ok(&joined)["session"]["question"].is_string());

    let answered = rpc(
        &alpha.app,
        "handshake.answer",
        json!({ "session_id": session_id, "answer": GOOD_ANSWER }),
        Auth::Agent,
    )
    .await;
    assert_eq!(ok(&answered)["peer_status"], "accepted");

    let alpha_pool = alpha.pool().clone();
    let delivered = eventually(|| {
        count(
            &alpha_pool,
            "SELECT COUNT(*) FROM peer_credentials WHERE peer_domain = ?1 AND tier = 'permanent'",
            BETA,
        ) == 1
    })
    .await;
    assert!(delivered, "handshake result never reached the joining node");

    Federation { alpha, beta }
}

#[tokio::test]
async fn heuristic_admission_befriends_both_sides() {
    let Federation { alpha, beta } = federate().await;

    let on_beta = rpc(&beta.app, "friendship.list", json!({ "status": "active" }), Auth::Agent).await;
    let friends = ok(&on_beta)["friendships"].as_array().unwrap().clone();
    assert_eq!(friends.len(), 1);
    assert_eq!(friends[0]["peer_domain"], ALPHA);

    let on_alpha = rpc(&alpha.app, "friendship.list", json!({ "status": "active" }), Auth::Agent).await;
    let friends = ok(&on_alpha)["friendships"].as_array().unwrap().clone();
    assert_eq!(friends.len(), 1);
    assert_eq!(friends[0]["peer_domain"], BETA);

    assert_eq!(
        count(
            beta.pool(),
            "SELECT COUNT(*) FROM handshake_sessions WHERE requesting_domain = ?1 AND status = 'accepted'",
            ALPHA,
        ),
        1
    );
}

async fn send_to(node: &Node, to: &str, content: &str) -> String {
    let key = operator_key(&node.state.node_domain);
    let sent = rpc(
        &node.app,
        "message.send",
        signed_send(&key, OPERATOR, to, content),
        Auth::Agent,
    )
    .await;
    assert_eq!(ok(&sent)["status"], "sent_to_federated");
    ok(&sent)["message_id"].as_str().unwrap().to_string()
}

async fn wait_for_forward(node: &Node, message_id: &str) {
    let pool = node.pool().clone();
    let arrived = eventually(|| {
        count(&pool, "SELECT COUNT(*) FROM messages WHERE message_id = ?1", message_id) == 1
    })
    .await;
    assert!(arrived, "message {message_id} was never forwarded");
}

#[tokio::test]
async fn forwarded_message_response_is_collected_by_polling() {
    let Federation { alpha, beta } = federate().await;

    let message_id = send_to(&alpha, BETA, "what is your uptime?").await;
    wait_for_forward(&beta, &message_id).await;
    assert_eq!(
        count(
            beta.pool(),
            "SELECT COUNT(*) FROM messages
             WHERE message_id = ?1 AND json_extract(metadata, '$.verified_author') = 'operator'",
            &message_id,
        ),
        1
    );

    let responded = rpc(
        &beta.app,
        "message.respond",
        json!({ "message_id": message_id, "content": "forty days" }),
        Auth::Agent,
    )
    .await;
    assert_eq!(ok(&responded)["from_domain"], BETA);

    let polled = rpc(&alpha.app, "federation.poll", json!({}), Auth::Agent).await;
    let report = ok(&polled);
    assert_eq!(report["targets"], 1);
    assert_eq!(report["errors"], json!([]));
    assert_eq!(report["new_responses"][0]["content"], "forty days");

    let reviewed = rpc(&alpha.app, "message.review", json!({}), Auth::Agent).await;
    let sent = ok(&reviewed)["sent"].as_array().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["status"], "responded");
    assert_eq!(sent[0]["responses"].as_array().unwrap().len(), 1);

    // Nothing left to poll.
    let again = rpc(&alpha.app, "federation.poll", json!({}), Auth::Agent).await;
    assert_eq!(ok(&again)["targets"], 0);
}

#[tokio::test]
async fn one_unreachable_target_does_not_stop_the_poll() {
    let Federation { alpha, beta } = federate().await;

    let to_beta = send_to(&alpha, BETA, "ping from alpha").await;
    send_to(&alpha, GAMMA, "anyone home?").await;
    wait_for_forward(&beta, &to_beta).await;

    let responded = rpc(
        &beta.app,
        "message.respond",
        json!({ "message_id": to_beta, "content": "pong from beta" }),
        Auth::Agent,
    )
    .await;
    ok(&responded);

    let polled = rpc(&alpha.app, "federation.poll", json!({}), Auth::Agent).await;
    let report = ok(&polled);
    assert_eq!(report["targets"], 2);
    assert_eq!(report["new_responses"].as_array().unwrap().len(), 1);
    let errors = report["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["target"], GAMMA);
}

#[tokio::test]
async fn gossip_push_swaps_recent_messages() {
    let Federation { alpha, beta } = federate().await;

    let published = rpc(
        &alpha.app,
        "gossip.publish",
        json!({ "content": "alpha saw a new node", "category": "network" }),
        Auth::Agent,
    )
    .await;
    ok(&published);
    let published = rpc(
        &beta.app,
        "gossip.publish",
        json!({ "content": "beta is upgrading tonight", "category": "status" }),
        Auth::Agent,
    )
    .await;
    ok(&published);

    let stored = push_gossip(&alpha.state).await.unwrap();
    assert_eq!(stored, 1);

    assert_eq!(
        count(
            beta.pool(),
            "SELECT COUNT(*) FROM gossip_messages WHERE source_id = ?1",
            ALPHA,
        ),
        1
    );
    assert_eq!(
        count(
            alpha.pool(),
            "SELECT COUNT(*) FROM gossip_messages WHERE source_id = ?1",
            BETA,
        ),
        1
    );

    // A second push finds nothing new on either side.
    assert_eq!(push_gossip(&alpha.state).await.unwrap(), 0);
}
