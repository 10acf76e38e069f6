//! Node lifecycle service.
//!
//! [`NodeService`] ties the registry, the transport, the topology and the
//! event controller together and drives a node through its states:
//!
//! - **Starting**: bind the transport, build the local [`ServerInfo`]
//! - **Joining**: register and fetch the live nodes in one registry call,
//!   then handshake with each (failures are logged, not fatal)
//! - **Running**: heartbeat loop + reconciliation loop
//! - **Stopping**: cancel loops, unregister (bounded), close everything
//!
//! A node that finds itself missing from the registry stops itself and
//! fires [`NodeService::fatal_signal`].

mod error;
mod heartbeat;
mod inbound;
mod reconciler;
mod state;

pub use error::NodeError;
pub use state::NodeState;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use shoal_id::{ActorId, NodeId, NodeIdentity};
use shoal_reconcile::RetryTracker;
use shoal_wire::{EncodeContext, InternalPacket, JsonCodec, MessageType, PayloadCodec};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::controller::EventController;
use crate::correlation::{CorrelationStats, CorrelationTable};
use crate::events::{ClusterEvent, LeaveReason, EVENT_CAPACITY};
use crate::registry::{ClusterRegistry, RegistryStore};
use crate::server_info::ServerInfo;
use crate::topology::{RemoteNode, TopologyManager};
use crate::transport::{NodeTransport, TransportStats};

use inbound::InboundRouter;

// =============================================================================
// Configuration
// =============================================================================

/// Timing of the lifecycle loops.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Time between heartbeats.
    pub heartbeat_interval: Duration,

    /// Registry entry TTL.
    pub heartbeat_ttl: Duration,

    /// Time between reconciliation ticks.
    pub reconcile_interval: Duration,

    /// Wait before retrying a failed heartbeat.
    pub heartbeat_retry_delay: Duration,

    /// Default request timeout.
    pub request_timeout: Duration,

    /// Bound on the unregister call during stop.
    pub unregister_timeout: Duration,

    /// Failed dials to one peer before it is left alone.
    pub dial_max_retries: u32,

    /// Window the dial failures are counted in.
    pub dial_retry_window: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        NodeConfig::default().lifecycle_config()
    }
}

// =============================================================================
// Peer Set
// =============================================================================

/// State shared by the lifecycle and the inbound router.
pub(crate) struct PeerSet {
    local_id: NodeId,
    topology: Arc<TopologyManager>,
    controller: Arc<dyn EventController>,
    correlation: Arc<CorrelationTable<InternalPacket>>,
    events: broadcast::Sender<ClusterEvent>,
    handshake_payload: OnceLock<Bytes>,
    codec: JsonCodec,
}

impl PeerSet {
    /// Adds a peer to the topology. Returns false if it was already known.
    fn add(&self, info: ServerInfo) -> bool {
        if info.node_id == self.local_id {
            return false;
        }

        let node = Arc::new(RemoteNode::new(info));
        if !self.topology.try_add(Arc::clone(&node)) {
            return false;
        }

        info!(
            node_id = %node.node_id(),
            group = %node.group(),
            address = %node.info().address,
            "Node joined"
        );
        self.controller.on_join(&node);
        self.publish(ClusterEvent::NodeJoined {
            node_id: node.node_id(),
            group: node.group().to_string(),
        });
        true
    }

    /// Removes a peer from the topology and marks it closed.
    fn remove(&self, node_id: NodeId, reason: LeaveReason) -> Option<Arc<RemoteNode>> {
        let node = self.topology.try_remove(node_id)?;
        if node.close() {
            info!(node_id = %node_id, reason = ?reason, "Node left");
            self.controller.on_leave(&node);
            self.publish(ClusterEvent::NodeLeft { node_id, reason });
        }
        Some(node)
    }

    fn publish(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Bookkeeping of failed dials.
struct Membership {
    retries: RetryTracker<NodeId>,
    /// Peers whose dial retries are exhausted; left alone until they leave.
    unreachable: HashSet<NodeId>,
}

// =============================================================================
// Node Service
// =============================================================================

struct NodeInner {
    info: ServerInfo,
    config: LifecycleConfig,
    registry: ClusterRegistry,
    transport: NodeTransport,
    peers: Arc<PeerSet>,
    state: watch::Sender<NodeState>,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    membership: Mutex<Membership>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

/// A running cluster node.
#[derive(Clone)]
pub struct NodeService {
    inner: Arc<NodeInner>,
}

impl NodeService {
    /// Starts a node: binds, joins the cluster and spawns the loops.
    ///
    /// Bind exhaustion and registry failures during join abort the start.
    pub async fn start(
        config: NodeConfig,
        store: Arc<dyn RegistryStore>,
        controller: Arc<dyn EventController>,
    ) -> Result<Self, NodeError> {
        let identity = NodeIdentity::generate(config.node_kind.as_str());
        let local_id = identity.node_id();
        info!(node_id = %local_id, identity = %identity, kind = %config.node_kind, "Starting node");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let peers = Arc::new(PeerSet {
            local_id,
            topology: Arc::new(TopologyManager::new()),
            controller,
            correlation: Arc::new(CorrelationTable::new()),
            events,
            handshake_payload: OnceLock::new(),
            codec: JsonCodec,
        });

        let router = Arc::new(InboundRouter::new(Arc::clone(&peers)));
        let transport = NodeTransport::start(config.transport_config(), identity.clone(), router).await?;

        let info = ServerInfo::new(
            identity,
            config.node_kind,
            config.api_name.clone(),
            config.stickiness,
            &config.host,
            transport.local_port(),
        );
        let payload = peers.codec.encode(&info, &mut EncodeContext::new())?;
        let _ = peers.handshake_payload.set(payload);

        let lifecycle = config.lifecycle_config();
        let inner = Arc::new(NodeInner {
            membership: Mutex::new(Membership {
                retries: RetryTracker::new(lifecycle.dial_max_retries, lifecycle.dial_retry_window),
                unreachable: HashSet::new(),
            }),
            info,
            config: lifecycle,
            registry: ClusterRegistry::new(store),
            transport,
            peers,
            state: watch::Sender::new(NodeState::Starting),
            shutdown: CancellationToken::new(),
            fatal: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        });
        let service = Self { inner };

        service.inner.transition(NodeState::Joining);
        if let Err(e) = service.inner.join().await {
            warn!(error = %e, "Join failed, shutting down");
            service.stop().await;
            return Err(e);
        }

        let heartbeat = tokio::spawn(heartbeat::run_heartbeat_loop(Arc::clone(&service.inner)));
        let reconcile = tokio::spawn(reconciler::run_reconcile_loop(Arc::clone(&service.inner)));
        service.inner.lock_tasks().extend([heartbeat, reconcile]);

        service.inner.transition(NodeState::Running);
        Ok(service)
    }

    /// Published info of this node.
    pub fn info(&self) -> &ServerInfo {
        &self.inner.info
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.info.node_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.info.identity
    }

    /// Address peers dial, `tcp://host:port`.
    pub fn local_address(&self) -> &str {
        &self.inner.info.address
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.borrow()
    }

    /// Watch channel following the node state.
    pub fn watch_state(&self) -> watch::Receiver<NodeState> {
        self.inner.state.subscribe()
    }

    /// Receiver of cluster events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.peers.events.subscribe()
    }

    /// Cancelled when the node hits a fatal condition (self-eviction).
    pub fn fatal_signal(&self) -> CancellationToken {
        self.inner.fatal.clone()
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.inner.peers.topology
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }

    pub fn request_stats(&self) -> CorrelationStats {
        self.inner.peers.correlation.stats()
    }

    /// Sends a one-way packet to a connected node.
    pub fn send_to(
        &self,
        node_id: NodeId,
        message_type: MessageType,
        actor_id: ActorId,
        payload: Bytes,
    ) -> Result<(), NodeError> {
        let node = self.connected(node_id)?;
        let packet = InternalPacket::new(self.node_id(), message_type, actor_id, payload);
        self.inner.transport.send(node.identity(), packet)?;
        Ok(())
    }

    /// Sends a request to a connected node and waits for the correlated
    /// reply, up to the configured request timeout.
    pub async fn request(
        &self,
        node_id: NodeId,
        message_type: MessageType,
        actor_id: ActorId,
        payload: Bytes,
    ) -> Result<InternalPacket, NodeError> {
        let timeout = self.inner.config.request_timeout;
        let cancel = self.inner.shutdown.child_token();
        self.request_with(node_id, message_type, actor_id, payload, timeout, &cancel)
            .await
    }

    /// Like [`NodeService::request`] with an explicit timeout and
    /// cancellation token.
    pub async fn request_with(
        &self,
        node_id: NodeId,
        message_type: MessageType,
        actor_id: ActorId,
        payload: Bytes,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<InternalPacket, NodeError> {
        let node = self.connected(node_id)?;
        let correlation = &self.inner.peers.correlation;

        let key = correlation.next_key();
        let pending = correlation.register(key)?;
        let packet = InternalPacket::new(self.node_id(), message_type, actor_id, payload)
            .with_request_key(key);

        if let Err(e) = self.inner.transport.send(node.identity(), packet) {
            correlation.try_fail(key, e.to_string());
            return Err(e.into());
        }

        debug!(node_id = %node_id, request_key = %key, message_type = %message_type, "Request sent");
        Ok(correlation.wait(pending, timeout, cancel).await?)
    }

    /// Sends a request to the next node of an API group, round-robin.
    pub async fn request_api(
        &self,
        api_name: &str,
        message_type: MessageType,
        actor_id: ActorId,
        payload: Bytes,
    ) -> Result<InternalPacket, NodeError> {
        let node = self
            .inner
            .peers
            .topology
            .round_robin(api_name)
            .ok_or_else(|| NodeError::NoNodeForApi(api_name.to_string()))?;
        self.request(node.node_id(), message_type, actor_id, payload).await
    }

    fn connected(&self, node_id: NodeId) -> Result<Arc<RemoteNode>, NodeError> {
        self.inner
            .peers
            .topology
            .get(node_id)
            .filter(|node| !node.is_closed())
            .ok_or(NodeError::UnknownNode(node_id))
    }

    /// Stops the node. Idempotent; concurrent callers wait for the first.
    pub async fn stop(&self) {
        let inner = &self.inner;

        if inner.stopping.swap(true, Ordering::AcqRel) {
            let mut state = inner.state.subscribe();
            let _ = state.wait_for(|s| *s == NodeState::Stopped).await;
            return;
        }

        inner.transition(NodeState::Stopping);
        inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *inner.lock_tasks());
        for task in tasks {
            let _ = task.await;
        }

        let node_id = inner.info.node_id;
        match tokio::time::timeout(inner.config.unregister_timeout, inner.registry.unregister(node_id)).await {
            Ok(Ok(())) => debug!(node_id = %node_id, "Unregistered"),
            Ok(Err(e)) => warn!(node_id = %node_id, error = %e, "Failed to unregister"),
            Err(_) => warn!(
                node_id = %node_id,
                timeout_ms = inner.config.unregister_timeout.as_millis() as u64,
                "Unregister timed out"
            ),
        }

        inner.peers.correlation.shutdown();
        inner.peers.controller.shutdown().await;

        for node in inner.peers.topology.node_ids() {
            inner.peers.remove(node, LeaveReason::Shutdown);
        }

        inner.transport.shutdown().await;
        inner.transition(NodeState::Stopped);
        info!(node_id = %node_id, "Node stopped");
    }
}

impl NodeInner {
    fn transition(&self, to: NodeState) -> bool {
        let from = *self.state.borrow();
        if !from.can_transition_to(to) {
            debug!(from = %from, to = %to, "Ignoring state transition");
            return false;
        }

        self.state.send_replace(to);
        info!(node_id = %self.info.node_id, from = %from, to = %to, "Node state changed");
        self.peers.publish(ClusterEvent::StateChanged { from, to });
        true
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_membership(&self) -> std::sync::MutexGuard<'_, Membership> {
        self.membership
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers and handshakes with every node already live.
    async fn join(&self) -> Result<(), NodeError> {
        let others = self
            .registry
            .register_and_get_others(&self.info, self.config.heartbeat_ttl)
            .await?;

        info!(node_id = %self.info.node_id, peers = others.len(), "Joining cluster");

        for other in &others {
            if let Err(e) = self.connect_peer(other).await {
                warn!(
                    node_id = %other.node_id,
                    address = %other.address,
                    error = %e,
                    "Could not connect to peer during join"
                );
            }
        }
        Ok(())
    }

    /// Handshakes with `remote` and adds it to the topology.
    ///
    /// Returns Ok(false) if the node was already connected.
    async fn connect_peer(&self, remote: &ServerInfo) -> Result<bool, NodeError> {
        if self.peers.topology.contains(remote.node_id) {
            return Ok(false);
        }

        let payload = self
            .peers
            .handshake_payload
            .get()
            .cloned()
            .ok_or(NodeError::InvalidState(NodeState::Starting))?;

        let reply = match self.transport.connect_async(&remote.address, payload).await {
            Ok(reply) => reply,
            Err(e) => {
                self.peers.topology.try_remove(remote.node_id);
                return Err(e.into());
            }
        };

        let announced: ServerInfo = match self.peers.codec.decode(&reply.payload) {
            Ok(info) => info,
            Err(e) => {
                self.transport.disconnect(&reply.peer);
                return Err(e.into());
            }
        };

        if announced.node_id != remote.node_id {
            self.transport.disconnect(&reply.peer);
            return Err(NodeError::IdentityMismatch {
                address: remote.address.clone(),
                expected: remote.node_id,
                actual: announced.node_id,
            });
        }

        Ok(self.peers.add(announced))
    }
}
