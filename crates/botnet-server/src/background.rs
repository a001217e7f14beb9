//! Periodic background tasks for a node.
//!
//! Includes:
//! - Expiring and deleting stale handshake sessions.
//! - Dropping elapsed rate-limit windows.
//! - Sweeping expired public keys from the cache.
//! - Purging expired negotiation and session credentials.
//! - Pushing gossip to active friends.
//! - Polling federated targets for message responses.
//!
//! Every task sleeps between runs and stops as soon as the shutdown signal
//! fires, abandoning a run that is still in progress. An interval of zero
//! disables a task.

use crate::peers::call_with_session;
use crate::polling::poll_federated_responses;
use crate::remote::RemoteError;
use crate::rpc::RpcError;
use crate::{run_blocking, AppState};
use botnet_federation::{friendship, handshake, token};
use botnet_gossip::{GossipMessage, IncomingGossip};
use botnet_types::time::now_millis;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Handles of the running background tasks.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Starts every enabled task.
    pub fn spawn(state: Arc<AppState>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let janitor = &state.config.janitor;
        let mut handles = Vec::new();

        handles.push(tokio::spawn(start_session_sweep_task(
            state.clone(),
            janitor.session_sweep_secs,
            rx.clone(),
        )));
        handles.push(tokio::spawn(start_rate_limit_gc_task(
            state.clone(),
            janitor.rate_limit_gc_secs,
            rx.clone(),
        )));
        handles.push(tokio::spawn(start_key_sweep_task(
            state.clone(),
            state.config.cache.sweep_interval_secs,
            rx.clone(),
        )));
        handles.push(tokio::spawn(start_credential_purge_task(
            state.clone(),
            janitor.credential_purge_secs,
            rx.clone(),
        )));
        handles.push(tokio::spawn(start_gossip_push_task(
            state.clone(),
            state.config.gossip.push_interval_secs,
            rx.clone(),
        )));
        handles.push(tokio::spawn(start_federation_poll_task(
            state.clone(),
            janitor.federation_poll_secs,
            rx,
        )));

        Self { shutdown, handles }
    }

    /// Signals every task to stop and waits for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("background task join error: {}", e);
            }
        }
        tracing::info!("background tasks stopped");
    }
}

/// Runs `tick` every `interval_secs` until `shutdown` fires.
///
/// A run still in flight when the signal arrives is dropped at its next
/// await point, so outbound calls to slow peers never hold up shutdown.
async fn run_periodic<F, Fut>(
    name: &'static str,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    if interval_secs == 0 {
        tracing::warn!(task = name, "background task disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_secs);
    tracing::info!(task = name, interval_secs, "starting background task");

    while !*shutdown.borrow() {
        tokio::select! {
            _ = sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }
        tokio::select! {
            _ = tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!(task = name, "shutdown requested, abandoning run in progress");
                    break;
                }
            }
        }
    }
    tracing::debug!(task = name, "background task stopped");
}

pub async fn start_session_sweep_task(
    state: Arc<AppState>,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) {
    run_periodic("session-sweep", interval_secs, shutdown, || {
        let state = state.clone();
        async move {
            let retention_ms = state.handshake.retention_ms;
            let result = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
                Ok(handshake::sweep_sessions(conn, now_millis(), retention_ms)?)
            })
            .await;
            match result {
                Ok(report) if report.expired > 0 || report.deleted > 0 => {
                    tracing::info!(
                        expired = report.expired,
                        deleted = report.deleted,
                        "swept handshake sessions"
                    );
                }
                Ok(_) => tracing::debug!("no stale handshake sessions"),
                Err(e) => tracing::error!("failed to sweep handshake sessions: {}", e),
            }
        }
    })
    .await;
}

pub async fn start_rate_limit_gc_task(
    state: Arc<AppState>,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) {
    run_periodic("rate-limit-gc", interval_secs, shutdown, || {
        let removed = state.rate_limiter.gc();
        if removed > 0 {
            tracing::debug!(removed, "dropped elapsed rate-limit windows");
        }
        std::future::ready(())
    })
    .await;
}

pub async fn start_key_sweep_task(
    state: Arc<AppState>,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) {
    run_periodic("key-cache-sweep", interval_secs, shutdown, || {
        let removed = state.key_cache.remove_expired();
        if removed > 0 {
            tracing::info!(removed, "removed expired public keys");
        }
        std::future::ready(())
    })
    .await;
}

pub async fn start_credential_purge_task(
    state: Arc<AppState>,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) {
    run_periodic("credential-purge", interval_secs, shutdown, || {
        let state = state.clone();
        async move {
            let result = run_blocking(&state.pool, |conn| -> Result<_, RpcError> {
                Ok(token::purge_expired(conn, now_millis())?)
            })
            .await;
            match result {
                Ok(count) if count > 0 => tracing::info!(count, "purged expired credentials"),
                Ok(_) => tracing::debug!("no expired credentials to purge"),
                Err(e) => tracing::error!("failed to purge credentials: {}", e),
            }
        }
    })
    .await;
}

pub async fn start_gossip_push_task(
    state: Arc<AppState>,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) {
    run_periodic("gossip-push", interval_secs, shutdown, || {
        let state = state.clone();
        async move {
            match push_gossip(&state).await {
                Ok(stored) if stored > 0 => tracing::info!(stored, "gossip push stored new messages"),
                Ok(_) => tracing::debug!("gossip push stored nothing new"),
                Err(e) => tracing::error!("gossip push failed: {}", e),
            }
        }
    })
    .await;
}

/// Exchanges this node's recent gossip with every active friend and stores
/// the batches they return. Returns how many new messages were stored.
pub async fn push_gossip(state: &AppState) -> Result<usize, RpcError> {
    let node_domain = state.node_domain.clone();
    let batch = state.config.gossip.batch_size;
    let (peers, outgoing) = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
        let peers = friendship::active_peers(conn)?;
        let outgoing: Vec<IncomingGossip> =
            botnet_gossip::recent_self_authored(conn, &node_domain, batch)?
                .into_iter()
                .map(IncomingGossip::from)
                .collect();
        Ok((peers, outgoing))
    })
    .await?;

    let mut stored = 0;
    for peer in peers {
        let reply = match call_with_session(
            state,
            &peer,
            "gossip.exchange",
            json!({ "messages": outgoing }),
        )
        .await
        {
            Ok(reply) => reply,
            Err(RemoteError::NoCredential(_)) => {
                tracing::debug!(peer = %peer, "no credential held for friend, skipping gossip push");
                continue;
            }
            Err(e) => {
                tracing::warn!(peer = %peer, "gossip exchange failed: {}", e);
                continue;
            }
        };

        let incoming: Vec<IncomingGossip> =
            serde_json::from_value::<Vec<GossipMessage>>(
                reply.get("messages").cloned().unwrap_or(Value::Null),
            )
            .map(|messages| messages.into_iter().map(IncomingGossip::from).collect())
            .unwrap_or_default();
        if incoming.is_empty() {
            continue;
        }

        let node_domain = state.node_domain.clone();
        let report = run_blocking(&state.pool, move |conn| -> Result<_, RpcError> {
            Ok(botnet_gossip::handle_exchange(
                conn,
                &node_domain,
                &peer,
                &incoming,
                0,
            )?)
        })
        .await?;
        stored += report.received;
    }
    Ok(stored)
}

pub async fn start_federation_poll_task(
    state: Arc<AppState>,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) {
    run_periodic("federation-poll", interval_secs, shutdown, || {
        let state = state.clone();
        async move {
            match poll_federated_responses(&state).await {
                Ok(report) => {
                    if !report.new_responses.is_empty() || !report.errors.is_empty() {
                        tracing::info!(
                            targets = report.targets,
                            responses = report.new_responses.len(),
                            errors = report.errors.len(),
                            "polled federated targets"
                        );
                    }
                }
                Err(e) => tracing::error!("federation poll failed: {}", e),
            }
        }
    })
    .await;
}
