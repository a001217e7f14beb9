mod common;

use axum::http::StatusCode;
use botnet_server::app;
use common::{dead_url, send_json, test_config, test_state};
use serde_json::json;

const NODE: &str = "botnet.alpha";
const JOINER: &str = "botnet.joiner";

#[tokio::test]
async fn external_verdict_admits_joiner_once() {
    let mut config = test_config(NODE);
    config
        .federation
        .peer_urls
        .insert(JOINER.to_string(), dead_url().await);
    let (_db, state) = test_state(config);
    let pool = state.pool.clone();
    let app = app(state);

    let (status, _, joined) = send_json(
        &app,
        "POST",
        "/api/v1/handshake/join-request",
        Some(json!({ "domain": JOINER, "public_key": "pk-joiner" })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = joined["session_id"].as_str().unwrap().to_string();
    assert!(!joined["question"].as_str().unwrap().is_empty());

    let answer = json!({
        "session_id": session_id,
        "riddle_id": joined["riddle_id"],
        "answer": "Consensus emerges because every node weighs the evidence.",
        "callback_domain": JOINER,
        "challenge_token": joined["challenge_token"],
    });
    let (status, _, answered) = send_json(
        &app,
        "POST",
        "/api/v1/handshake/riddle-response",
        Some(answer.clone()),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answered["status"], "answered");

    let (status, _, _) = send_json(
        &app,
        "POST",
        "/api/v1/handshake/riddle-response",
        Some(answer),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, view) = send_json(
        &app,
        "GET",
        &format!("/handshake/status/{session_id}"),
        None,
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "answered");
    assert_eq!(view["requesting_domain"], JOINER);

    let verdict = json!({
        "session_id": session_id,
        "score": 85.0,
        "accepted": true,
        "feedback": "sound reasoning",
    });
    let (status, _, body) = send_json(
        &app,
        "POST",
        "/api/v1/handshake/result",
        Some(verdict.clone()),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _, result) = send_json(
        &app,
        "POST",
        "/api/v1/handshake/result",
        Some(verdict.clone()),
        true,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["session"]["status"], "accepted");
    assert_eq!(result["friendship"]["status"], "active");
    assert_eq!(result["friendship"]["peer_domain"], JOINER);

    let (status, _, _) = send_json(&app, "POST", "/api/v1/handshake/result", Some(verdict), true).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let conn = pool.get().unwrap();
    let permanent: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM credentials WHERE subject_domain = ?1 AND tier = 'permanent'",
            [JOINER],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(permanent, 1);
}

#[tokio::test]
async fn low_score_is_rejected_even_when_accepted() {
    let mut config = test_config(NODE);
    config
        .federation
        .peer_urls
        .insert(JOINER.to_string(), dead_url().await);
    let (_db, state) = test_state(config);
    let app = app(state);

    let (_, _, joined) = send_json(
        &app,
        "POST",
        "/handshake/join-request",
        Some(json!({ "domain": JOINER, "public_key": "pk-joiner" })),
        false,
    )
    .await;
    let session_id = joined["session_id"].as_str().unwrap().to_string();
    send_json(
        &app,
        "POST",
        "/handshake/riddle-response",
        Some(json!({
            "session_id": session_id,
            "riddle_id": joined["riddle_id"],
            "answer": "no idea",
            "callback_domain": JOINER,
            "challenge_token": joined["challenge_token"],
        })),
        false,
    )
    .await;

    let (status, _, result) = send_json(
        &app,
        "POST",
        "/handshake/result",
        Some(json!({ "session_id": session_id, "score": 40.0, "accepted": true })),
        true,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["session"]["status"], "rejected");
    assert!(result["friendship"].is_null());
}

#[tokio::test]
async fn mismatched_challenge_and_unknown_session_are_not_found() {
    let (_db, state) = test_state(test_config(NODE));
    let app = app(state);

    let (_, _, joined) = send_json(
        &app,
        "POST",
        "/api/v1/handshake/join-request",
        Some(json!({ "domain": JOINER, "public_key": "pk-joiner" })),
        false,
    )
    .await;
    let (status, _, _) = send_json(
        &app,
        "POST",
        "/api/v1/handshake/riddle-response",
        Some(json!({
            "session_id": joined["session_id"],
            "riddle_id": joined["riddle_id"],
            "answer": "an answer",
            "callback_domain": JOINER,
            "challenge_token": "00".repeat(16),
        })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send_json(&app, "GET", "/api/v1/handshake/status/missing", None, false).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send_json(
        &app,
        "POST",
        "/api/v1/handshake/join-request",
        Some(json!({ "domain": "example.com", "public_key": "pk" })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn handshake_routes_have_their_own_limit() {
    let mut config = test_config(NODE);
    config.rate_limit.handshake_limit = 2;
    let (_db, state) = test_state(config);
    let app = app(state);

    for _ in 0..2 {
        let (status, _, _) = send_json(&app, "GET", "/handshake/status/missing", None, false).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
    let (status, headers, body) =
        send_json(&app, "GET", "/handshake/status/missing", None, false).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key("retry-after"));
    assert!(body["error"].is_string());

    // Health checks bypass the limiter entirely.
    let (status, _, _) = send_json(&app, "GET", "/health", None, false).await;
    assert_eq!(status, StatusCode::OK);
}
