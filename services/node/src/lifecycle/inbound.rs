//! Inbound traffic routing.
//!
//! Sits behind the transport's IO loop: replies resolve pending requests,
//! requests go to the event controller, handshakes add the peer to the
//! topology.

use std::sync::Arc;

use bytes::Bytes;
use shoal_id::NodeIdentity;
use shoal_wire::{InternalPacket, PayloadCodec};
use tracing::{debug, warn};

use super::PeerSet;
use crate::controller::{ActorMessage, DispatchOutcome, Replier};
use crate::events::LeaveReason;
use crate::server_info::ServerInfo;
use crate::transport::{PacketSender, TransportError, TransportHandler};

pub(crate) struct InboundRouter {
    peers: Arc<PeerSet>,
}

impl InboundRouter {
    pub(crate) fn new(peers: Arc<PeerSet>) -> Self {
        Self { peers }
    }
}

impl TransportHandler for InboundRouter {
    fn on_handshake_request(
        &self,
        _sender: &Arc<dyn PacketSender>,
        peer: &NodeIdentity,
        packet: &InternalPacket,
    ) -> Option<Bytes> {
        let response = self.peers.handshake_payload.get().cloned()?;

        let info: ServerInfo = match self.peers.codec.decode(&packet.payload) {
            Ok(info) => info,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Rejecting handshake with undecodable info");
                return None;
            }
        };

        if info.identity != *peer || info.node_id != peer.node_id() {
            warn!(
                peer = %peer,
                announced = %info.identity,
                announced_id = %info.node_id,
                "Rejecting handshake whose info does not match the link identity"
            );
            return None;
        }

        self.peers.add(info);
        Some(response)
    }

    fn on_packet(&self, sender: &Arc<dyn PacketSender>, peer: &NodeIdentity, packet: InternalPacket) {
        if packet.is_reply() {
            if packet.destination_node_id() != Some(self.peers.local_id) {
                debug!(peer = %peer, request_key = %packet.request_key(), "Reply addressed to another node");
                return;
            }
            let key = packet.request_key();
            if !self.peers.correlation.try_reply(key, packet) {
                debug!(peer = %peer, request_key = %key, "Late or unknown reply dropped");
            }
            return;
        }

        let message = ActorMessage::new(packet, Replier::new(Arc::clone(sender), peer.clone()));
        if let DispatchOutcome::Dropped(reason) = self.peers.controller.on_packet(message) {
            debug!(peer = %peer, reason = ?reason, "Packet dropped");
        }
    }

    fn on_send_failed(&self, peer: &NodeIdentity, packet: &InternalPacket, error: &TransportError) {
        let key = packet.request_key();
        if packet.is_reply() || packet.message_type().is_handshake() || key.is_none() {
            return;
        }
        if self.peers.correlation.try_fail(key, error.to_string()) {
            debug!(peer = %peer, request_key = %key, "Failed pending request after send failure");
        }
    }

    fn on_disconnected(&self, peer: &NodeIdentity) {
        // The registry stays authoritative: a peer that is still live is
        // dialed again by the next reconciliation tick.
        self.peers.remove(peer.node_id(), LeaveReason::Disconnected);
    }
}
