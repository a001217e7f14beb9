mod common;

use axum::http::StatusCode;
use botnet_server::app;
use common::{
    bind, dead_url, error_code, ok, operator_public_key, rpc, send_json, serve, test_config,
    test_state, Auth,
};
use serde_json::json;

#[tokio::test]
async fn key_endpoint_serves_local_agents() {
    let (_db, state) = test_state(test_config("botnet.alpha"));
    let app = app(state);

    let (status, _, body) =
        send_json(&app, "GET", "/api/v1/agents/operator/publickey", None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["public_key"], operator_public_key("botnet.alpha"));
    assert_eq!(body["data"]["node_id"], "botnet.alpha");

    let (status, _, body) =
        send_json(&app, "GET", "/api/v1/agents/ghost/publickey", None, false).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn fetch_falls_through_to_next_neighbor_and_caches() {
    let (beta_listener, beta_url) = bind().await;
    let (_beta_db, beta) = test_state(test_config("botnet.beta"));
    serve(beta_listener, beta);

    let mut config = test_config("botnet.alpha");
    config
        .federation
        .peer_urls
        .insert("botnet.down".to_string(), dead_url().await);
    config
        .federation
        .peer_urls
        .insert("botnet.beta".to_string(), beta_url);
    let (_db, state) = test_state(config);
    let app = app(state);

    let fetched = rpc(
        &app,
        "keys.fetch",
        json!({ "agent_id": "operator", "neighbors": ["botnet.down", "botnet.beta"] }),
        Auth::Agent,
    )
    .await;
    let result = ok(&fetched);
    assert_eq!(result["key"]["public_key"], operator_public_key("botnet.beta"));
    assert_eq!(result["key"]["node_id"], "botnet.beta");
    assert!(result["ttl_remaining_secs"].as_u64().unwrap() > 0);

    // Served from the cache without asking the reachable neighbor.
    let cached = rpc(
        &app,
        "keys.fetch",
        json!({ "agent_id": "operator", "neighbors": ["botnet.down"] }),
        Auth::Agent,
    )
    .await;
    assert_eq!(ok(&cached)["key"]["public_key"], operator_public_key("botnet.beta"));

    let missing = rpc(
        &app,
        "keys.fetch",
        json!({ "agent_id": "ghost", "neighbors": ["botnet.down", "botnet.beta"] }),
        Auth::Agent,
    )
    .await;
    assert_eq!(error_code(&missing), -32004);
    assert_eq!(
        missing["error"]["data"]["failures"].as_array().unwrap().len(),
        2
    );
}

#[tokio::test]
async fn fetch_without_neighbors_is_unavailable() {
    let (_db, state) = test_state(test_config("botnet.alpha"));
    let app = app(state);

    let response = rpc(&app, "keys.fetch", json!({ "agent_id": "someone" }), Auth::Agent).await;
    assert_eq!(error_code(&response), -32010);
}

#[tokio::test]
async fn fetch_refuses_ids_that_would_change_the_request_path() {
    let (_db, state) = test_state(test_config("botnet.alpha"));
    let app = app(state);

    for agent_id in ["..", "op?x=1", "op#frag", "op%2F..", "a/b"] {
        let response = rpc(
            &app,
            "keys.fetch",
            json!({ "agent_id": agent_id, "neighbors": ["botnet.beta"] }),
            Auth::Agent,
        )
        .await;
        assert_eq!(error_code(&response), -32602, "{agent_id}");
    }
}
