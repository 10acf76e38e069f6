//! End-to-end cluster scenarios.
//!
//! Several nodes in one process share an in-memory registry and talk over
//! real sockets, verifying:
//!
//! 1. Joining forms a full mesh with one link per pair
//! 2. Requests get their correlated replies; unanswered ones time out
//! 3. API groups are served round-robin
//! 4. Entity actors see their messages in order
//! 5. A stopped node leaves the registry and its peers' topologies
//!
//! ## Running
//!
//! ```bash
//! cargo test -p shoal-e2e --test cluster
//! ```

mod harness;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shoal_id::ActorId;
use shoal_node::controller::{
    ActorMessage, EntityHandler, HandlerResult, PacketHandler, RoutingTable, StatefulController,
    StatelessController,
};
use shoal_node::events::LeaveReason;
use shoal_node::registry::{MemoryStore, RegistryStore};
use shoal_node::{ClusterEvent, NodeError, NodeKind, RequestError};
use shoal_wire::MessageType;
use tokio_util::sync::CancellationToken;

use harness::{config, eventually, init_tracing, start, wait_for_event, wait_for_mesh};

const ECHO: MessageType = MessageType::FIRST_APPLICATION;
const SILENT: MessageType = MessageType::new(1001);

const OPEN: MessageType = MessageType::new(2000);
const APPEND: MessageType = MessageType::new(2001);
const READ: MessageType = MessageType::new(2002);

fn echo(msg: &ActorMessage) -> HandlerResult {
    Ok(Some(msg.packet.payload.clone()))
}

fn silent(_: &ActorMessage) -> HandlerResult {
    Ok(None)
}

fn echo_controller() -> Arc<StatelessController> {
    Arc::new(StatelessController::new(
        RoutingTable::<dyn PacketHandler>::new()
            .route(ECHO, echo)
            .route(SILENT, silent),
    ))
}

fn store() -> Arc<dyn RegistryStore> {
    Arc::new(MemoryStore::new())
}

// =============================================================================
// Membership
// =============================================================================

#[tokio::test]
async fn test_two_nodes_connect_with_a_single_handshake() {
    init_tracing();
    let store = store();

    // A slow-ticking first node cannot race the joiner's handshake with a
    // reconciliation dial of its own.
    let a = start(
        config(NodeKind::MainApi, "").with_heartbeat(Duration::from_secs(1), Duration::from_secs(3)),
        &store,
        echo_controller(),
    )
    .await;
    let b = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;

    wait_for_mesh(&[&a, &b]).await;

    // Let both reconcile a few times.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let (sa, sb) = (a.transport_stats(), b.transport_stats());
    assert_eq!(sa.handshakes_initiated + sb.handshakes_initiated, 1);
    assert_eq!(sa.handshakes_accepted + sb.handshakes_accepted, 1);
    assert_eq!(sb.handshakes_initiated, 1, "the joiner dials");
    assert_eq!(sa.links, 1);
    assert_eq!(sb.links, 1);

    assert_eq!(a.topology().node_ids(), vec![b.node_id()]);
    assert_eq!(b.topology().node_ids(), vec![a.node_id()]);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_three_nodes_form_full_mesh() {
    init_tracing();
    let store = store();

    let a = start(config(NodeKind::Gateway, ""), &store, echo_controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;
    let c = start(config(NodeKind::SubApi, "billing"), &store, echo_controller()).await;

    wait_for_mesh(&[&a, &b, &c]).await;

    for node in [&a, &b, &c] {
        assert_eq!(node.topology().len(), 2);
    }
    assert_eq!(
        a.topology().group_members("billing").iter().map(|n| n.node_id()).collect::<Vec<_>>(),
        vec![c.node_id()]
    );
    assert_eq!(a.topology().group_members("main_api").len(), 1);

    for node in [&c, &b, &a] {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_stopped_node_leaves_registry_and_topology() {
    init_tracing();
    let store = store();

    let a = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;
    wait_for_mesh(&[&a, &b]).await;

    let mut events = a.subscribe();
    let b_id = b.node_id();
    b.stop().await;

    assert!(!store.live_ids().await.unwrap().contains(&b_id));

    let left = wait_for_event(&mut events, |e| {
        matches!(e, ClusterEvent::NodeLeft { node_id, .. } if *node_id == b_id)
    })
    .await;
    match left {
        ClusterEvent::NodeLeft { reason, .. } => {
            assert!(matches!(reason, LeaveReason::Disconnected | LeaveReason::Expired));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!a.topology().contains(b_id));

    // The departed node is not dialed again.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!a.topology().contains(b_id));

    a.stop().await;
}

#[tokio::test]
async fn test_dropped_link_is_redialed_while_peer_is_live() {
    init_tracing();
    let store = store();

    let a = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;
    wait_for_mesh(&[&a, &b]).await;

    // One side loses the peer; the registry still lists it, so the larger
    // id reconnects and the pair heals.
    let b_id = b.node_id();
    let a_id = a.node_id();
    let (larger, smaller) = if a_id > b_id { (&a, b_id) } else { (&b, a_id) };
    larger.topology().try_remove(smaller);

    wait_for_mesh(&[&a, &b]).await;
    let reply = a
        .request(b_id, ECHO, ActorId::default(), Bytes::from_static(b"still here"))
        .await
        .expect("request after heal");
    assert_eq!(reply.payload, Bytes::from_static(b"still here"));
    assert!(larger.transport_stats().handshakes_initiated >= 1);

    b.stop().await;
    a.stop().await;
}

// =============================================================================
// Requests
// =============================================================================

#[tokio::test]
async fn test_request_gets_correlated_reply() {
    init_tracing();
    let store = store();

    let a = start(config(NodeKind::Gateway, ""), &store, echo_controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;
    wait_for_mesh(&[&a, &b]).await;

    let reply = a
        .request(b.node_id(), ECHO, ActorId::new(7), Bytes::from_static(b"hello"))
        .await
        .expect("echo reply");

    assert!(reply.is_reply());
    assert_eq!(reply.payload, Bytes::from_static(b"hello"));
    assert_eq!(reply.actor_id(), ActorId::new(7));
    assert_eq!(reply.destination_node_id(), Some(a.node_id()));

    // Both directions work over the one link.
    let reply = b
        .request(a.node_id(), ECHO, ActorId::default(), Bytes::from_static(b"back"))
        .await
        .expect("reverse echo reply");
    assert_eq!(reply.payload, Bytes::from_static(b"back"));

    let stats = a.request_stats();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.pending, 0);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_match_their_replies() {
    init_tracing();
    let store = store();

    let a = start(config(NodeKind::Gateway, ""), &store, echo_controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;
    wait_for_mesh(&[&a, &b]).await;

    let tasks: Vec<_> = (0..32u64)
        .map(|i| {
            let a = a.clone();
            let target = b.node_id();
            tokio::spawn(async move {
                let payload = Bytes::from(format!("req-{i}"));
                let reply = a.request(target, ECHO, ActorId::new(i), payload.clone()).await;
                (payload, reply)
            })
        })
        .collect();

    for task in tasks {
        let (sent, reply) = task.await.unwrap();
        assert_eq!(reply.expect("reply").payload, sent);
    }
    assert_eq!(a.request_stats().succeeded, 32);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    init_tracing();
    let store = store();

    let a = start(config(NodeKind::Gateway, ""), &store, echo_controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;
    wait_for_mesh(&[&a, &b]).await;

    let cancel = CancellationToken::new();
    for message_type in [SILENT, MessageType::new(4242)] {
        let err = a
            .request_with(
                b.node_id(),
                message_type,
                ActorId::default(),
                Bytes::new(),
                Duration::from_millis(200),
                &cancel,
            )
            .await
            .expect_err("no reply is sent");
        assert!(
            matches!(err, NodeError::Request(RequestError::Timeout { .. })),
            "unexpected error: {err}"
        );
    }

    let stats = a.request_stats();
    assert_eq!(stats.timed_out, 2);
    assert_eq!(stats.pending, 0);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn test_pending_requests_are_cancelled_on_stop() {
    init_tracing();
    let store = store();

    let a = start(config(NodeKind::Gateway, ""), &store, echo_controller()).await;
    let b = start(config(NodeKind::MainApi, ""), &store, echo_controller()).await;
    wait_for_mesh(&[&a, &b]).await;

    let waiting = {
        let a = a.clone();
        let target = b.node_id();
        tokio::spawn(async move { a.request(target, SILENT, ActorId::default(), Bytes::new()).await })
    };
    eventually("request pending", || {
        let a = a.clone();
        async move { a.request_stats().pending == 1 }
    })
    .await;

    a.stop().await;

    let err = waiting.await.unwrap().expect_err("stop cancels the wait");
    assert!(
        matches!(err, NodeError::Request(RequestError::Cancelled { .. })),
        "unexpected error: {err}"
    );

    b.stop().await;
}

// =============================================================================
// API Groups
// =============================================================================

#[tokio::test]
async fn test_request_api_round_robins_over_group() {
    init_tracing();
    let store = store();

    let gateway = start(config(NodeKind::Gateway, ""), &store, echo_controller()).await;

    let mut members = Vec::new();
    for name in ["b1", "b2", "b3"] {
        let controller = Arc::new(StatelessController::new(
            RoutingTable::<dyn PacketHandler>::new().route(ECHO, move |_: &ActorMessage| -> HandlerResult {
                Ok(Some(Bytes::from_static(name.as_bytes())))
            }),
        ));
        members.push(start(config(NodeKind::SubApi, "billing"), &store, controller).await);
    }

    eventually("billing group complete", || {
        let gateway = gateway.clone();
        async move { gateway.topology().group_members("billing").len() == 3 }
    })
    .await;

    let mut served: HashMap<Bytes, usize> = HashMap::new();
    for _ in 0..9 {
        let reply = gateway
            .request_api("billing", ECHO, ActorId::default(), Bytes::new())
            .await
            .expect("billing reply");
        *served.entry(reply.payload).or_default() += 1;
    }

    assert_eq!(served.len(), 3);
    assert!(served.values().all(|count| *count == 3), "{served:?}");

    let err = gateway
        .request_api("shipping", ECHO, ActorId::default(), Bytes::new())
        .await
        .expect_err("nobody serves shipping");
    assert!(matches!(err, NodeError::NoNodeForApi(_)));

    for member in &members {
        member.stop().await;
    }
    gateway.stop().await;
}

// =============================================================================
// Entity Actors
// =============================================================================

fn append(log: &mut String, msg: &ActorMessage) -> HandlerResult {
    log.push_str(&String::from_utf8_lossy(&msg.packet.payload));
    Ok(None)
}

fn read(log: &mut String, _: &ActorMessage) -> HandlerResult {
    Ok(Some(Bytes::from(log.clone())))
}

fn open(_: &mut String, _: &ActorMessage) -> HandlerResult {
    Ok(Some(Bytes::from_static(b"opened")))
}

fn entity_controller() -> Arc<StatefulController<String>> {
    let routes = RoutingTable::<dyn EntityHandler<String>>::new()
        .route(OPEN, open)
        .route(APPEND, append)
        .route(READ, read);
    Arc::new(StatefulController::new(routes, |_| String::new()).create_on(OPEN))
}

#[tokio::test]
async fn test_entity_messages_are_processed_in_order() {
    init_tracing();
    let store = store();

    let client = start(config(NodeKind::Gateway, ""), &store, echo_controller()).await;
    let entities = entity_controller();
    let host = start(config(NodeKind::MainApi, ""), &store, entities.clone()).await;
    wait_for_mesh(&[&client, &host]).await;

    let entity = ActorId::new(7);
    let opened = client
        .request(host.node_id(), OPEN, entity, Bytes::new())
        .await
        .expect("open reply");
    assert_eq!(opened.payload, Bytes::from_static(b"opened"));
    assert!(entities.actors().contains(entity));

    for part in ["a", "b", "c", "d", "e"] {
        client
            .send_to(host.node_id(), APPEND, entity, Bytes::from_static(part.as_bytes()))
            .expect("append queued");
    }

    let log = client
        .request(host.node_id(), READ, entity, Bytes::new())
        .await
        .expect("read reply");
    assert_eq!(log.payload, Bytes::from_static(b"abcde"));

    client.stop().await;
    host.stop().await;
    assert!(entities.actors().is_empty());
}

#[tokio::test]
async fn test_message_for_missing_entity_is_dropped() {
    init_tracing();
    let store = store();

    let client = start(config(NodeKind::Gateway, ""), &store, echo_controller()).await;
    let entities = entity_controller();
    let host = start(config(NodeKind::MainApi, ""), &store, entities.clone()).await;
    wait_for_mesh(&[&client, &host]).await;

    let err = client
        .request_with(
            host.node_id(),
            READ,
            ActorId::new(99),
            Bytes::new(),
            Duration::from_millis(200),
            &CancellationToken::new(),
        )
        .await
        .expect_err("missing entity never answers");
    assert!(matches!(err, NodeError::Request(RequestError::Timeout { .. })));
    assert!(!entities.actors().contains(ActorId::new(99)));

    client.stop().await;
    host.stop().await;
}
