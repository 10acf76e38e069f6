//! Heartbeat loop keeping the node's registry entry alive.
//!
//! Every interval the entry's TTL is refreshed. A failed refresh is retried
//! after a short fixed delay instead of a full interval, so a brief registry
//! outage does not eat into the TTL.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::NodeInner;

/// Failures logged as warnings before escalating to errors.
const WARN_FAILURES: u32 = 3;

/// Run the heartbeat loop until shutdown.
pub(super) async fn run_heartbeat_loop(inner: Arc<NodeInner>) {
    let node_id = inner.info.node_id;
    let interval = inner.config.heartbeat_interval;
    let ttl = inner.config.heartbeat_ttl;
    let shutdown = inner.shutdown.clone();

    info!(
        node_id = %node_id,
        interval_ms = interval.as_millis() as u64,
        ttl_ms = ttl.as_millis() as u64,
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut next = interval;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(next) => {}
        }

        match inner.registry.update_heartbeat(node_id, ttl).await {
            Ok(true) => {
                if consecutive_failures > 0 {
                    info!(node_id = %node_id, consecutive_failures, "Heartbeat recovered");
                }
                consecutive_failures = 0;
                next = interval;
                debug!(node_id = %node_id, "Heartbeat acknowledged");
            }
            Ok(false) => {
                // Eviction is detected and handled by reconciliation.
                warn!(node_id = %node_id, "Heartbeat found no live registry entry");
                next = interval;
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures <= WARN_FAILURES {
                    warn!(node_id = %node_id, error = %e, consecutive_failures, "Heartbeat failed");
                } else {
                    error!(node_id = %node_id, error = %e, consecutive_failures, "Heartbeat failed repeatedly");
                }
                next = inner.config.heartbeat_retry_delay;
            }
        }
    }

    info!(node_id = %node_id, "Heartbeat loop shutting down");
}
