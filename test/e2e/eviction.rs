//! End-to-end eviction scenarios.
//!
//! Registry wrappers can silence one node's heartbeats, or give one node a
//! stale view in which its own entry never seems to expire. Verifies:
//!
//! 1. Peers drop an expired node from their topology
//! 2. The expired node notices its own absence, publishes `SelfEvicted`,
//!    fires the fatal signal and stops
//! 3. A node whose registry comes back before the TTL runs out survives
//! 4. Reconciliation removes an expired peer even while its link is up
//!
//! ## Running
//!
//! ```bash
//! cargo test -p shoal-e2e --test eviction
//! ```

mod harness;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shoal_id::NodeId;
use shoal_node::controller::{RoutingTable, StatelessController};
use shoal_node::registry::{MemoryStore, RegistryError, RegistryStore};
use shoal_node::events::LeaveReason;
use shoal_node::{ClusterEvent, NodeKind, NodeState};

use harness::{config, init_tracing, start, wait_for_event, wait_for_mesh, HEARTBEAT, TTL};

/// Registry whose heartbeats fail for selected nodes.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    silenced: Mutex<HashSet<NodeId>>,
}

impl FlakyStore {
    fn silence(&self, node_id: NodeId) {
        self.silenced.lock().unwrap().insert(node_id);
    }

    fn restore(&self, node_id: NodeId) {
        self.silenced.lock().unwrap().remove(&node_id);
    }

    fn is_silenced(&self, node_id: NodeId) -> bool {
        self.silenced.lock().unwrap().contains(&node_id)
    }
}

#[async_trait]
impl RegistryStore for FlakyStore {
    async fn put(&self, node_id: NodeId, value: String, ttl: Duration) -> Result<(), RegistryError> {
        self.inner.put(node_id, value, ttl).await
    }

    async fn put_and_read_all(
        &self,
        node_id: NodeId,
        value: String,
        ttl: Duration,
    ) -> Result<Vec<(NodeId, String)>, RegistryError> {
        self.inner.put_and_read_all(node_id, value, ttl).await
    }

    async fn touch(&self, node_id: NodeId, ttl: Duration) -> Result<bool, RegistryError> {
        if self.is_silenced(node_id) {
            return Err(RegistryError::Unavailable("heartbeat dropped".to_string()));
        }
        self.inner.touch(node_id, ttl).await
    }

    async fn live_ids(&self) -> Result<HashSet<NodeId>, RegistryError> {
        self.inner.live_ids().await
    }

    async fn get(&self, node_id: NodeId) -> Result<Option<String>, RegistryError> {
        self.inner.get(node_id).await
    }

    async fn read_all(&self) -> Result<Vec<(NodeId, String)>, RegistryError> {
        self.inner.read_all().await
    }

    async fn remove(&self, node_id: NodeId) -> Result<(), RegistryError> {
        self.inner.remove(node_id).await
    }
}

/// One node's view of a shared registry that can go stale. Once frozen,
/// heartbeats report success without refreshing the entry and the node
/// still sees itself as live, so it keeps running while the real entry
/// expires for everyone else.
struct StaleView {
    inner: Arc<MemoryStore>,
    owner: Mutex<Option<NodeId>>,
    frozen: AtomicBool,
}

impl StaleView {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            owner: Mutex::new(None),
            frozen: AtomicBool::new(false),
        }
    }

    fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    fn claim(&self, node_id: NodeId) {
        self.owner.lock().unwrap().get_or_insert(node_id);
    }

    fn owner(&self) -> Option<NodeId> {
        *self.owner.lock().unwrap()
    }
}

#[async_trait]
impl RegistryStore for StaleView {
    async fn put(&self, node_id: NodeId, value: String, ttl: Duration) -> Result<(), RegistryError> {
        self.claim(node_id);
        self.inner.put(node_id, value, ttl).await
    }

    async fn put_and_read_all(
        &self,
        node_id: NodeId,
        value: String,
        ttl: Duration,
    ) -> Result<Vec<(NodeId, String)>, RegistryError> {
        self.claim(node_id);
        self.inner.put_and_read_all(node_id, value, ttl).await
    }

    async fn touch(&self, node_id: NodeId, ttl: Duration) -> Result<bool, RegistryError> {
        if self.is_frozen() && self.owner() == Some(node_id) {
            return Ok(true);
        }
        self.inner.touch(node_id, ttl).await
    }

    async fn live_ids(&self) -> Result<HashSet<NodeId>, RegistryError> {
        let mut ids = self.inner.live_ids().await?;
        if self.is_frozen() {
            ids.extend(self.owner());
        }
        Ok(ids)
    }

    async fn get(&self, node_id: NodeId) -> Result<Option<String>, RegistryError> {
        self.inner.get(node_id).await
    }

    async fn read_all(&self) -> Result<Vec<(NodeId, String)>, RegistryError> {
        self.inner.read_all().await
    }

    async fn remove(&self, node_id: NodeId) -> Result<(), RegistryError> {
        self.inner.remove(node_id).await
    }
}

fn controller() -> Arc<StatelessController> {
    Arc::new(StatelessController::new(RoutingTable::new()))
}

#[tokio::test]
async fn test_silent_node_expires_and_evicts_itself() {
    init_tracing();
    let flaky = Arc::new(FlakyStore::default());
    let store: Arc<dyn RegistryStore> = flaky.clone();

    let a = start(config(NodeKind::MainApi, ""), &store, controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &store, controller()).await;
    wait_for_mesh(&[&a, &b]).await;

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    let b_id = b.node_id();
    let fatal = b.fatal_signal();

    flaky.silence(b_id);

    let evicted = wait_for_event(&mut b_events, |e| matches!(e, ClusterEvent::SelfEvicted { .. })).await;
    assert_eq!(evicted, ClusterEvent::SelfEvicted { node_id: b_id });

    tokio::time::timeout(harness::WAIT, fatal.cancelled())
        .await
        .expect("fatal signal should fire");

    let mut state = b.watch_state();
    tokio::time::timeout(harness::WAIT, state.wait_for(|s| *s == NodeState::Stopped))
        .await
        .expect("evicted node should stop")
        .unwrap();

    wait_for_event(&mut a_events, |e| {
        matches!(e, ClusterEvent::NodeLeft { node_id, .. } if *node_id == b_id)
    })
    .await;
    assert!(!a.topology().contains(b_id));
    assert!(!flaky.live_ids().await.unwrap().contains(&b_id));

    // The survivor keeps running and stays registered.
    assert_eq!(a.state(), NodeState::Running);
    assert!(!a.fatal_signal().is_cancelled());
    assert!(flaky.live_ids().await.unwrap().contains(&a.node_id()));

    a.stop().await;
}

#[tokio::test]
async fn test_short_registry_outage_is_survived() {
    init_tracing();
    let flaky = Arc::new(FlakyStore::default());
    let store: Arc<dyn RegistryStore> = flaky.clone();

    let a = start(config(NodeKind::MainApi, ""), &store, controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &store, controller()).await;
    wait_for_mesh(&[&a, &b]).await;

    // Well inside the TTL.
    flaky.silence(b.node_id());
    tokio::time::sleep(TTL / 4).await;
    flaky.restore(b.node_id());

    tokio::time::sleep(TTL * 2).await;

    assert_eq!(b.state(), NodeState::Running);
    assert!(!b.fatal_signal().is_cancelled());
    assert!(a.topology().contains(b.node_id()));
    assert!(b.topology().contains(a.node_id()));

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_expired_peer_is_removed_while_its_link_is_up() {
    init_tracing();
    let memory = Arc::new(MemoryStore::new());
    let view = Arc::new(StaleView::new(Arc::clone(&memory)));
    let a_store: Arc<dyn RegistryStore> = memory.clone();
    let b_store: Arc<dyn RegistryStore> = view.clone();

    let a = start(config(NodeKind::MainApi, ""), &a_store, controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &b_store, controller()).await;
    wait_for_mesh(&[&a, &b]).await;
    assert_eq!(view.owner(), Some(b.node_id()));

    let mut a_events = a.subscribe();
    let b_id = b.node_id();

    view.freeze();
    let frozen_at = tokio::time::Instant::now();

    let left = wait_for_event(&mut a_events, |e| {
        matches!(e, ClusterEvent::NodeLeft { node_id, .. } if *node_id == b_id)
    })
    .await;
    assert_eq!(
        left,
        ClusterEvent::NodeLeft {
            node_id: b_id,
            reason: LeaveReason::Expired,
        }
    );

    // The entry outlives the freeze by at most one TTL; the next tick
    // notices. The extra ticks absorb scheduler jitter.
    let elapsed = frozen_at.elapsed();
    assert!(elapsed <= TTL + HEARTBEAT * 6, "removed after {elapsed:?}");

    // B never saw itself expire.
    assert_eq!(b.state(), NodeState::Running);
    assert!(!b.fatal_signal().is_cancelled());

    b.stop().await;
    a.stop().await;
}
