//! Event controllers: routing of inbound application packets.
//!
//! Every controller implements [`EventController`] and is chosen when the
//! node is built:
//! - [`StatelessController`]: each packet is handled on its own task and the
//!   optional result is sent back as the reply
//! - [`StatefulController`]: packets go to a long-lived entity actor keyed by
//!   the packet's actor id; some message types create the actor on demand
//!
//! "No handler" and "unknown actor" are outcomes, not errors: the packet is
//! logged and dropped and nothing is reported to the sender.

mod routing;
mod stateful;
mod stateless;

pub use routing::{EntityHandler, HandlerResult, PacketHandler, RoutingTable};
pub use stateful::StatefulController;
pub use stateless::StatelessController;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use shoal_id::{ActorId, NodeIdentity};
use shoal_wire::{InternalPacket, MessageType, PayloadCodec, WireError};
use thiserror::Error;

use crate::topology::RemoteNode;
use crate::transport::{PacketSender, TransportError};

// =============================================================================
// Messages
// =============================================================================

/// Sends replies back over the link a packet arrived on.
#[derive(Clone)]
pub struct Replier {
    sender: Arc<dyn PacketSender>,
    peer: NodeIdentity,
}

impl Replier {
    pub fn new(sender: Arc<dyn PacketSender>, peer: NodeIdentity) -> Self {
        Self { sender, peer }
    }

    /// Identity of the node the packet came from.
    pub fn peer(&self) -> &NodeIdentity {
        &self.peer
    }

    /// Queues any packet for the peer.
    pub fn send(&self, packet: InternalPacket) -> Result<(), TransportError> {
        self.sender.send(&self.peer, packet)
    }
}

impl std::fmt::Debug for Replier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replier").field("peer", &self.peer).finish()
    }
}

/// One inbound application packet on its way to a handler.
#[derive(Debug, Clone)]
pub struct ActorMessage {
    pub packet: InternalPacket,
    pub replier: Replier,
}

impl ActorMessage {
    pub fn new(packet: InternalPacket, replier: Replier) -> Self {
        Self { packet, replier }
    }

    pub fn message_type(&self) -> MessageType {
        self.packet.message_type()
    }

    pub fn actor_id(&self) -> ActorId {
        self.packet.actor_id()
    }

    /// Decodes the payload.
    pub fn decode<T: DeserializeOwned>(&self, codec: &impl PayloadCodec) -> Result<T, DispatchError> {
        Ok(codec.decode(&self.packet.payload)?)
    }

    /// Sends `payload` back as the reply to this packet.
    ///
    /// Packets without a correlation key expect no reply; nothing is sent.
    pub fn reply(&self, payload: Bytes) -> Result<bool, TransportError> {
        if self.packet.request_key().is_none() || self.packet.is_reply() {
            return Ok(false);
        }
        self.replier.send(self.packet.reply(payload))?;
        Ok(true)
    }
}

// =============================================================================
// Outcomes and Errors
// =============================================================================

/// Why a packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No route for the message type.
    NoHandler(MessageType),
    /// The target actor does not exist and the type does not create it.
    UnknownActor(ActorId),
    /// The target actor stopped accepting messages.
    ActorStopped(ActorId),
}

/// Result of handing a packet to a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Queued for an existing handler or actor.
    Dispatched,
    /// A new actor was created and the packet queued to it.
    Created,
    /// Logged and dropped.
    Dropped(DropReason),
}

/// Errors raised while handling one packet.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Application handler failure.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The payload could not be decoded or the reply encoded.
    #[error(transparent)]
    Codec(#[from] WireError),

    /// The reply could not be queued.
    #[error("reply failed: {0}")]
    Reply(#[from] TransportError),
}

// =============================================================================
// Controller Trait
// =============================================================================

/// Strategy for routing inbound application packets.
#[async_trait]
pub trait EventController: Send + Sync + 'static {
    /// Routes one packet. Called in arrival order; must not block.
    fn on_packet(&self, msg: ActorMessage) -> DispatchOutcome;

    /// A peer joined the topology.
    fn on_join(&self, _node: &Arc<RemoteNode>) {}

    /// A peer left the topology.
    fn on_leave(&self, _node: &Arc<RemoteNode>) {}

    /// Creates the actor for `actor_id` if the controller keeps actors.
    ///
    /// Returns true if a new actor was created.
    fn create_actor(&self, actor_id: ActorId) -> bool;

    /// Waits for in-flight work to finish.
    async fn shutdown(&self) {}
}
