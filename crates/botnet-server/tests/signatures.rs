//! Agent signatures on `message.send`: local agents are checked against
//! their configured key, messages forwarded by a peer against the key the
//! peer's node serves for the author.

mod common;

use axum::Router;
use botnet_db::DbPool;
use botnet_server::app;
use common::{
    bind, error_code, ok, operator_key, rpc, serve, signed_send, test_config, test_state, Auth,
    OPERATOR,
};
use serde_json::{json, Value};
use tempfile::NamedTempFile;

const ALPHA: &str = "botnet.alpha";
const BETA: &str = "botnet.beta";

struct Beta {
    _dbs: (NamedTempFile, NamedTempFile),
    pool: DbPool,
    app: Router,
    /// Session token alpha holds on beta.
    session: String,
}

/// Serves alpha on a real socket for its key endpoint and befriends it on beta.
async fn beta_with_alpha_friend() -> Beta {
    let (alpha_listener, alpha_url) = bind().await;
    let (alpha_db, alpha_state) = test_state(test_config(ALPHA));
    serve(alpha_listener, alpha_state);

    let mut config = test_config(BETA);
    config
        .federation
        .peer_urls
        .insert(ALPHA.to_string(), alpha_url);
    let (beta_db, state) = test_state(config);
    let pool = state.pool.clone();
    let app = app(state);

    let requested = rpc(&app, "friendship.request", json!({ "domain": ALPHA }), Auth::None).await;
    let negotiation = ok(&requested)["negotiation_token"]
        .as_str()
        .unwrap()
        .to_string();
    ok(&rpc(&app, "friendship.accept", json!({ "domain": ALPHA }), Auth::Agent).await);
    let status = rpc(
        &app,
        "friendship.status",
        json!({ "domain": ALPHA }),
        Auth::Bearer(&negotiation),
    )
    .await;
    let permanent = ok(&status)["permanent_credential"]
        .as_str()
        .unwrap()
        .to_string();
    let login = rpc(
        &app,
        "login",
        json!({ "domain": ALPHA, "credential": permanent }),
        Auth::None,
    )
    .await;
    let session = ok(&login)["session_token"].as_str().unwrap().to_string();

    Beta {
        _dbs: (alpha_db, beta_db),
        pool,
        app,
        session,
    }
}

fn forwarded(mut params: Value) -> Value {
    params["metadata"] = json!({ "original_sender": OPERATOR, "origin_node": ALPHA });
    params
}

fn stored_messages(pool: &DbPool) -> i64 {
    let conn = pool.get().unwrap();
    conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
        .unwrap()
}

#[tokio::test]
async fn forwarded_message_signed_by_its_author_is_stored() {
    let beta = beta_with_alpha_friend().await;

    let params = forwarded(signed_send(&operator_key(ALPHA), OPERATOR, BETA, "status report"));
    let sent = rpc(&beta.app, "message.send", params, Auth::Bearer(&beta.session)).await;
    let message = ok(&sent);
    assert_eq!(message["from_domain"], ALPHA);

    let conn = beta.pool.get().unwrap();
    let author: String = conn
        .query_row(
            "SELECT json_extract(metadata, '$.verified_author') FROM messages WHERE message_id = ?1",
            [message["message_id"].as_str().unwrap()],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(author, OPERATOR);
}

#[tokio::test]
async fn forged_or_missing_signatures_are_refused() {
    let beta = beta_with_alpha_friend().await;

    // Signed with a key that is not the one alpha serves for its operator.
    let forged = forwarded(signed_send(&operator_key(BETA), OPERATOR, BETA, "send funds"));
    let refused = rpc(&beta.app, "message.send", forged, Auth::Bearer(&beta.session)).await;
    assert_eq!(error_code(&refused), -32011);
    assert!(refused["error"]["data"]["reason"]
        .as_str()
        .unwrap()
        .contains("does not match"));

    // Content altered after signing.
    let mut tampered = forwarded(signed_send(&operator_key(ALPHA), OPERATOR, BETA, "hello"));
    tampered["content"] = json!("hello, send funds");
    let refused = rpc(&beta.app, "message.send", tampered, Auth::Bearer(&beta.session)).await;
    assert_eq!(error_code(&refused), -32011);

    let unsigned = forwarded(json!({ "to_domain": BETA, "content": "trust me" }));
    let refused = rpc(&beta.app, "message.send", unsigned, Auth::Bearer(&beta.session)).await;
    assert_eq!(error_code(&refused), -32011);
    assert_eq!(refused["error"]["data"]["reason"], "message is not signed");

    // Signed but naming no author.
    let anonymous = signed_send(&operator_key(ALPHA), OPERATOR, BETA, "who am i");
    let refused = rpc(&beta.app, "message.send", anonymous, Auth::Bearer(&beta.session)).await;
    assert_eq!(error_code(&refused), -32602);

    assert_eq!(stored_messages(&beta.pool), 0);
}

#[tokio::test]
async fn local_agent_signatures_use_the_configured_key() {
    let (_db, state) = test_state(test_config(BETA));
    let pool = state.pool.clone();
    let app = app(state);

    let valid = signed_send(&operator_key(BETA), OPERATOR, "scout", "good morning");
    let sent = rpc(&app, "message.send", valid, Auth::Agent).await;
    assert_eq!(ok(&sent)["status"], "delivered_locally");

    let forged = signed_send(&operator_key(ALPHA), OPERATOR, "scout", "good night");
    let refused = rpc(&app, "message.send", forged, Auth::Agent).await;
    assert_eq!(error_code(&refused), -32011);

    let mut half = signed_send(&operator_key(BETA), OPERATOR, "scout", "hi");
    half.as_object_mut().unwrap().remove("signed_at");
    let refused = rpc(&app, "message.send", half, Auth::Agent).await;
    assert_eq!(error_code(&refused), -32602);

    // Unsigned messages from local agents are still accepted.
    let plain = rpc(
        &app,
        "message.send",
        json!({ "to_domain": "scout", "content": "plain" }),
        Auth::Agent,
    )
    .await;
    ok(&plain);

    assert_eq!(stored_messages(&pool), 2);
}
