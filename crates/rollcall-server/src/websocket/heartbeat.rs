//! Heartbeat liveness: evict sessions that stop sending HEARTBEAT.
//!
//! Transport close is not enough to detect a dead peer, so a sweep runs every
//! interval and drops sessions whose last heartbeat is older than the
//! timeout. Eviction removes the session from the registry and cancels its
//! connection task.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::SubscriptionRegistry;
use crate::metrics::SESSIONS_EVICTED_TOTAL;

/// Evict every session silent for longer than `timeout`. Returns the count.
pub fn sweep_once(registry: &SubscriptionRegistry, timeout: Duration) -> usize {
    let mut evicted = 0;
    for session in registry.sessions() {
        let silent = session.since_heartbeat();
        if silent <= timeout {
            continue;
        }
        if registry.remove_session(&session.id).is_some() {
            info!(
                session_id = %session.id,
                user_id = %session.user_id,
                silent_ms = u64::try_from(silent.as_millis()).unwrap_or(u64::MAX),
                "heartbeat timeout, evicting session"
            );
            counter!(SESSIONS_EVICTED_TOTAL, "reason" => "heartbeat").increment(1);
            evicted += 1;
        }
        session.close();
    }
    evicted
}

/// Run the eviction sweep every `interval` until `cancel` fires.
pub async fn run_sweep(
    registry: Arc<SubscriptionRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = sweep_once(&registry, timeout);
                if evicted > 0 {
                    debug!(evicted, "heartbeat sweep");
                }
            }
            () = cancel.cancelled() => {
                debug!("heartbeat sweep cancelled");
                return;
            }
        }
    }
}
