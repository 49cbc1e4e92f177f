//! Heartbeat sweep (§4.8): workers ping `/heartbeat` every `ping_interval`;
//! this background task periodically evicts any client whose last ping is
//! older than a grace period and logs the re-run path selection, mirroring
//! `websocket_manager.py`'s periodic liveness check.

use crate::state::CoordinatorState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Grace period before a client is considered dead: a few missed pings,
/// matching the worker's own `max_retry_attempts` * `retry_delay` budget
/// before it gives up reconnecting.
fn grace_period(state: &CoordinatorState) -> Duration {
    let retries = state.config.max_retry_attempts.max(1) as f64;
    Duration::from_secs_f64(state.config.ping_interval_secs + retries * state.config.retry_delay_secs)
}

pub async fn run_heartbeat_sweep(state: Arc<CoordinatorState>) {
    let mut interval = tokio::time::interval(state.config.ping_interval());
    loop {
        interval.tick().await;
        let grace = grace_period(&state);
        let removed = state.membership.write().await.sweep_stale(grace);
        for client in removed {
            warn!(client_id = %client.client_id, "evicted client after missed heartbeats, path recomputed");
        }
        let path_ok = state.membership.read().await.find_continuous_path().is_ok();
        if !path_ok {
            info!("no covering path after heartbeat sweep; new requests will be refused");
        }
    }
}
