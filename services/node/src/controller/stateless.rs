//! Stateless controller: one task per packet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shoal_id::ActorId;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{ActorMessage, DispatchOutcome, DropReason, EventController, PacketHandler, RoutingTable};
use crate::topology::RemoteNode;

/// How long shutdown waits for in-flight handlers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handles each packet on its own task and replies with the handler's
/// result. Packets for the same actor may run concurrently.
pub struct StatelessController {
    routes: Arc<RoutingTable<dyn PacketHandler>>,
    tasks: TaskTracker,
}

impl StatelessController {
    pub fn new(routes: RoutingTable<dyn PacketHandler>) -> Self {
        Self {
            routes: Arc::new(routes),
            tasks: TaskTracker::new(),
        }
    }

    /// Handlers still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }
}

#[async_trait]
impl EventController for StatelessController {
    fn on_packet(&self, msg: ActorMessage) -> DispatchOutcome {
        let message_type = msg.message_type();
        let Some(handler) = self.routes.get(message_type).cloned() else {
            warn!(
                message_type = %message_type,
                peer = %msg.replier.peer(),
                "No handler for message type, dropping"
            );
            return DispatchOutcome::Dropped(DropReason::NoHandler(message_type));
        };

        self.tasks.spawn(async move {
            let request_key = msg.packet.request_key();
            match handler.handle(&msg).await {
                Ok(Some(payload)) => match msg.reply(payload) {
                    Ok(true) => debug!(message_type = %message_type, request_key = %request_key, "Reply queued"),
                    Ok(false) => debug!(message_type = %message_type, "Packet expects no reply, result discarded"),
                    Err(e) => warn!(message_type = %message_type, request_key = %request_key, error = %e, "Failed to queue reply"),
                },
                Ok(None) => {}
                Err(e) => warn!(
                    message_type = %message_type,
                    request_key = %request_key,
                    error = %e,
                    "Handler failed"
                ),
            }
        });

        DispatchOutcome::Dispatched
    }

    fn on_join(&self, node: &Arc<RemoteNode>) {
        debug!(node_id = %node.node_id(), group = %node.group(), "Peer available");
    }

    fn on_leave(&self, node: &Arc<RemoteNode>) {
        debug!(node_id = %node.node_id(), group = %node.group(), "Peer gone");
    }

    fn create_actor(&self, _actor_id: ActorId) -> bool {
        false
    }

    async fn shutdown(&self) {
        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tasks.wait()).await.is_err() {
            warn!(in_flight = self.tasks.len(), "Handlers still running at shutdown");
        } else {
            info!("Stateless controller drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{HandlerResult, Replier};
    use crate::transport::{PacketSender, TransportError};
    use bytes::Bytes;
    use shoal_id::{NodeId, NodeIdentity, RequestKey};
    use shoal_wire::{InternalPacket, MessageType};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured {
        sent: Mutex<Vec<(NodeIdentity, InternalPacket)>>,
    }

    impl PacketSender for Captured {
        fn send(&self, peer: &NodeIdentity, packet: InternalPacket) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((peer.clone(), packet));
            Ok(())
        }
    }

    fn echo(msg: &ActorMessage) -> HandlerResult {
        Ok(Some(msg.packet.payload.clone()))
    }

    fn message(sender: &Arc<Captured>, message_type: u32, key: u32) -> ActorMessage {
        let packet = InternalPacket::new(
            NodeId::new(10),
            MessageType::new(message_type),
            ActorId::new(1),
            Bytes::from_static(b"ping"),
        )
        .with_request_key(RequestKey::new(key));
        let sender: Arc<dyn PacketSender> = sender.clone();
        ActorMessage::new(packet, Replier::new(sender, NodeIdentity::from_bytes(&b"peer"[..])))
    }

    #[tokio::test]
    async fn test_handler_result_is_sent_as_reply() {
        let sender = Arc::new(Captured::default());
        let controller = StatelessController::new(
            RoutingTable::<dyn PacketHandler>::new().route(MessageType::new(1000), echo),
        );

        let outcome = controller.on_packet(message(&sender, 1000, 5));
        assert_eq!(outcome, DispatchOutcome::Dispatched);
        controller.shutdown().await;

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (peer, reply) = &sent[0];
        assert_eq!(peer.as_bytes(), b"peer");
        assert!(reply.is_reply());
        assert_eq!(reply.request_key(), RequestKey::new(5));
        assert_eq!(reply.destination_node_id(), Some(NodeId::new(10)));
        assert_eq!(&reply.payload[..], b"ping");
    }

    #[tokio::test]
    async fn test_one_way_packet_gets_no_reply() {
        let sender = Arc::new(Captured::default());
        let controller = StatelessController::new(
            RoutingTable::<dyn PacketHandler>::new().route(MessageType::new(1000), echo),
        );

        controller.on_packet(message(&sender, 1000, 0));
        controller.shutdown().await;
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped() {
        let sender = Arc::new(Captured::default());
        let controller = StatelessController::new(RoutingTable::<dyn PacketHandler>::new());

        let outcome = controller.on_packet(message(&sender, 4242, 1));
        assert_eq!(
            outcome,
            DispatchOutcome::Dropped(DropReason::NoHandler(MessageType::new(4242)))
        );
        assert!(!controller.create_actor(ActorId::new(1)));
        controller.shutdown().await;
        assert!(sender.sent.lock().unwrap().is_empty());
    }
}
