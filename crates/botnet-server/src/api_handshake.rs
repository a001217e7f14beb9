//! REST surface of the admission handshake.
//!
//! A joining node posts a join request, receives a riddle and answers it.
//! The answer is scored by the configured judge; an external judge posts
//! its verdict to `/result`. Once a session is finalised the joining node is
//! notified through its `handshake.result` RPC method.

use crate::api::ApiError;
use crate::middleware::{resolve_caller, Caller};
use crate::{run_blocking, AppState};
use axum::{
    extract::{Extension, Json, Path},
    http::HeaderMap,
};
use botnet_federation::{handshake, HandshakeOutcome, RiddleResponse, Verdict};
use botnet_types::time::now_millis;
use botnet_types::HandshakeStatus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub domain: String,
    pub public_key: String,
    #[serde(default)]
    pub node_info: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub session_id: String,
    pub riddle_id: String,
    pub question: String,
    pub category: String,
    pub difficulty: f64,
    pub challenge_token: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: String,
    pub status: HandshakeStatus,
    pub requesting_domain: String,
    pub riddle_id: String,
    pub score: Option<f64>,
    pub feedback: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl SessionView {
    fn from_session(session: &handshake::HandshakeSession) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.effective_status(now_millis()),
            requesting_domain: session.requesting_domain.clone(),
            riddle_id: session.riddle_id.clone(),
            score: session.score,
            feedback: session.feedback.clone(),
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

/// Handler for `POST /handshake/join-request`.
pub async fn join_request_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let st = state.clone();
    let (session, riddle) = run_blocking(&state.pool, move |conn| -> Result<_, ApiError> {
        Ok(handshake::start_handshake(
            conn,
            &st.handshake,
            &payload.domain,
            &payload.public_key,
            payload.node_info,
        )?)
    })
    .await?;

    Ok(Json(JoinResponse {
        session_id: session.id,
        riddle_id: riddle.id,
        question: riddle.question,
        category: riddle.category,
        difficulty: riddle.difficulty,
        challenge_token: session.challenge_token,
        expires_at: session.expires_at,
    }))
}

/// Handler for `POST /handshake/riddle-response`.
///
/// Records the answer and asks the judge. A judge that answers immediately
/// finalises the session before the response is returned.
pub async fn riddle_response_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<RiddleResponse>,
) -> Result<Json<SessionView>, ApiError> {
    let judge = state.judge.clone();
    let (session, verdict) = run_blocking(&state.pool, move |conn| -> Result<_, ApiError> {
        let session = handshake::process_riddle_response(conn, &payload)?;
        let riddle = handshake::session_riddle(conn, &session)?;
        let answer = session.answer.clone().unwrap_or_default();
        let verdict = judge.evaluate(&riddle, &answer);
        Ok((session, verdict))
    })
    .await?;

    match verdict {
        Some(verdict) => {
            let outcome = finalize(&state, session.id.clone(), verdict).await?;
            Ok(Json(SessionView::from_session(&outcome.session)))
        }
        None => {
            tracing::info!(session_id = %session.id, "answer awaiting external evaluation");
            Ok(Json(SessionView::from_session(&session)))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResultRequest {
    pub session_id: String,
    pub score: f64,
    pub accepted: bool,
    #[serde(default)]
    pub feedback: String,
}

/// Handler for `POST /handshake/result`, the external evaluator callback.
///
/// Only agents configured on this node may post verdicts.
pub async fn result_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ResultRequest>,
) -> Result<Json<Value>, ApiError> {
    match resolve_caller(&headers, &state.config.node.agents) {
        Ok(Caller::LocalAgent(_)) => {}
        Ok(_) => return Err(ApiError::Unauthorized("evaluator agent required".to_string())),
        Err(_) => return Err(ApiError::Unauthorized("invalid agent credentials".to_string())),
    }

    let verdict = Verdict {
        score: payload.score,
        accepted: payload.accepted,
        feedback: payload.feedback,
    };
    let outcome = finalize(&state, payload.session_id, verdict).await?;

    Ok(Json(json!({
        "session": SessionView::from_session(&outcome.session),
        "friendship": outcome.friendship,
    })))
}

/// Handler for `GET /handshake/status/{session_id}`.
pub async fn status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = run_blocking(&state.pool, move |conn| -> Result<_, ApiError> {
        Ok(handshake::get_handshake_session(conn, &session_id)?)
    })
    .await?;
    Ok(Json(SessionView::from_session(&session)))
}

/// Applies a verdict and notifies the joining node in the background.
async fn finalize(
    state: &Arc<AppState>,
    session_id: String,
    verdict: Verdict,
) -> Result<HandshakeOutcome, ApiError> {
    let st = state.clone();
    let outcome = run_blocking(&state.pool, move |conn| -> Result<_, ApiError> {
        Ok(handshake::process_handshake_result(
            conn,
            &st.handshake,
            &st.node_domain,
            &session_id,
            verdict.score,
            verdict.accepted,
            &verdict.feedback,
        )?)
    })
    .await?;

    tokio::spawn(notify_handshake_result(state.clone(), outcome.clone()));
    Ok(outcome)
}

/// Delivers a finalised result to the session's callback domain. Failures
/// are logged; the session keeps its final status either way.
pub async fn notify_handshake_result(state: Arc<AppState>, outcome: HandshakeOutcome) {
    let session = &outcome.session;
    let Some(callback) = session.callback_domain.as_deref() else {
        return;
    };
    let params = json!({
        "session_id": session.id,
        "domain": state.node_domain,
        "accepted": session.status == HandshakeStatus::Accepted,
        "score": session.score,
        "feedback": session.feedback,
        "permanent_credential": outcome.credential.as_ref().map(|c| c.token.as_str()),
    });

    match state.remote.call(callback, "handshake.result", params, None).await {
        Ok(_) => tracing::info!(session_id = %session.id, callback = %callback, "handshake result delivered"),
        Err(e) => tracing::warn!(
            session_id = %session.id,
            callback = %callback,
            "handshake result delivery failed: {}",
            e
        ),
    }
}
