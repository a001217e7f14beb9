//! Collection of responses to messages sent to federated domains.

use crate::peers::call_with_session;
use crate::rpc::RpcError;
use crate::signing::MessageSignature;
use crate::{run_blocking, AppState};
use botnet_messaging::{ingest_responses, pending_federated, MessageResponse, SendRequest};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollFailure {
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Number of target domains with pending messages.
    pub targets: usize,
    pub new_responses: Vec<MessageResponse>,
    pub errors: Vec<PollFailure>,
}

/// Asks every federated target with pending messages for responses.
///
/// A failing target is recorded in `errors` and does not stop the others.
pub async fn poll_federated_responses(state: &AppState) -> Result<PollReport, RpcError> {
    let groups = run_blocking(&state.pool, |conn| -> Result<_, RpcError> {
        Ok(pending_federated(conn)?)
    })
    .await?;

    let mut report = PollReport {
        targets: groups.keys().filter(|t| **t != state.node_domain).count(),
        ..PollReport::default()
    };

    for (target, message_ids) in groups {
        // Answered locally through message.respond.
        if target == state.node_domain {
            continue;
        }
        let fetched = call_with_session(
            state,
            &target,
            "message.checkResponses",
            json!({ "message_ids": message_ids }),
        )
        .await
        .map_err(|e| e.to_string())
        .and_then(|result| {
            serde_json::from_value::<Vec<MessageResponse>>(
                result.get("responses").cloned().unwrap_or(Value::Null),
            )
            .map_err(|e| format!("invalid responses payload: {e}"))
        });

        let responses = match fetched {
            Ok(responses) => responses,
            Err(error) => {
                tracing::warn!(target_domain = %target, "federated poll failed: {}", error);
                report.errors.push(PollFailure { target, error });
                continue;
            }
        };

        let target_owned = target.clone();
        let stored = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
            Ok(ingest_responses(conn, &target_owned, &responses)?)
        })
        .await;
        match stored {
            Ok(stored) => {
                if !stored.is_empty() {
                    tracing::info!(target_domain = %target, count = stored.len(), "ingested federated responses");
                }
                report.new_responses.extend(stored);
            }
            Err(e) => report.errors.push(PollFailure {
                target,
                error: e.message,
            }),
        }
    }

    Ok(report)
}

/// Delivers a message addressed to a federated domain to that domain's node.
///
/// The peer stores it under this node's domain as sender, keeping the
/// message id so responses can be correlated when polling. The author's
/// signature travels along so the peer can check it against the key this
/// node serves for the author.
pub async fn forward_message(
    state: &AppState,
    request: &SendRequest,
    message_id: &str,
    signed: Option<&MessageSignature>,
) {
    let mut params = json!({
        "to_domain": request.to_domain,
        "content": request.content,
        "message_type": request.message_type,
        "message_id": message_id,
        "metadata": {
            "original_sender": request.from_domain,
            "origin_node": state.node_domain,
        },
    });
    if let Some(signed) = signed {
        params["signature"] = json!(signed.signature);
        params["signed_at"] = json!(signed.signed_at);
    }
    match call_with_session(state, &request.to_domain, "message.send", params).await {
        Ok(_) => tracing::info!(message_id, target_domain = %request.to_domain, "forwarded message"),
        Err(e) => tracing::warn!(
            message_id,
            target_domain = %request.to_domain,
            "message forward failed, left for manual check: {}",
            e
        ),
    }
}
