//! Membership reconciliation loop.
//!
//! Every tick the registry's live set is compared with what this node knows
//! (its topology plus peers it gave up dialing):
//!
//! - local id missing: the node was evicted; stop and fire the fatal signal
//! - known but no longer live: drop from topology and disconnect
//! - live but unknown: dial if the local id is larger, otherwise wait for
//!   the peer's handshake
//!
//! A failed dial leaves the peer unknown, so it is tried again next tick,
//! until the retry budget for that peer is spent.

use std::collections::HashSet;
use std::sync::Arc;

use shoal_reconcile::plan_membership;
use tracing::{debug, error, info, warn};

use super::{NodeInner, NodeService};
use crate::events::{ClusterEvent, LeaveReason};

/// What a tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Tick {
    Continue,
    Evicted,
}

/// Run the reconciliation loop until shutdown or eviction.
pub(super) async fn run_reconcile_loop(inner: Arc<NodeInner>) {
    let node_id = inner.info.node_id;
    let shutdown = inner.shutdown.clone();

    info!(
        node_id = %node_id,
        interval_ms = inner.config.reconcile_interval.as_millis() as u64,
        "Starting reconciliation loop"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.config.reconcile_interval) => {}
        }

        if inner.reconcile_once().await == Tick::Evicted {
            error!(node_id = %node_id, "Node missing from registry, shutting down");
            inner.peers.publish(ClusterEvent::SelfEvicted { node_id });
            inner.fatal.cancel();

            let service = NodeService {
                inner: Arc::clone(&inner),
            };
            tokio::spawn(async move { service.stop().await });
            return;
        }
    }

    info!(node_id = %node_id, "Reconciliation loop shutting down");
}

impl NodeInner {
    /// One reconciliation pass.
    pub(super) async fn reconcile_once(&self) -> Tick {
        let local = self.info.node_id;

        let current = match self.registry.live_node_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(node_id = %local, error = %e, "Could not read live nodes, retrying next tick");
                return Tick::Continue;
            }
        };

        let previous: HashSet<_> = {
            let membership = self.lock_membership();
            self.peers
                .topology
                .node_ids()
                .into_iter()
                .chain(membership.unreachable.iter().copied())
                .chain(std::iter::once(local))
                .collect()
        };

        let plan = plan_membership(local, &previous, &current);
        if !plan.self_present {
            return Tick::Evicted;
        }
        if plan.is_noop() {
            return Tick::Continue;
        }

        for dead in &plan.dead {
            if let Some(node) = self.peers.remove(*dead, LeaveReason::Expired) {
                self.transport.disconnect(node.identity());
            }
            let mut membership = self.lock_membership();
            membership.unreachable.remove(dead);
            membership.retries.clear(dead);
        }

        for peer in &plan.dial {
            self.dial(*peer).await;
        }

        if !plan.await_inbound.is_empty() {
            debug!(node_id = %local, peers = ?plan.await_inbound, "Waiting for inbound handshakes");
        }

        self.lock_membership().retries.prune();
        Tick::Continue
    }

    async fn dial(&self, peer: shoal_id::NodeId) {
        let info = match self.registry.node_info(peer).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!(peer = %peer, "Peer vanished before dial");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Could not read peer info");
                return;
            }
        };

        match self.connect_peer(&info).await {
            Ok(_) => {
                self.lock_membership().retries.clear(&peer);
            }
            Err(e) => {
                let mut membership = self.lock_membership();
                if membership.retries.record_failure(&peer) {
                    membership.unreachable.insert(peer);
                    warn!(
                        peer = %peer,
                        address = %info.address,
                        error = %e,
                        "Giving up on peer until it leaves the registry"
                    );
                } else {
                    warn!(peer = %peer, address = %info.address, error = %e, "Dial failed, retrying next tick");
                }
            }
        }
    }
}
