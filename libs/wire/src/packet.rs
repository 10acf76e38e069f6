//! Packet header and frame encoding.

use bytes::{Buf, BufMut, Bytes};
use shoal_id::{ActorId, NodeId, RequestKey};

use crate::codec::EncodeContext;
use crate::error::WireError;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 8 + 4 + 4 + 1 + 8;

// =============================================================================
// Message Type
// =============================================================================

/// Numeric message type carried in every packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageType(u32);

impl MessageType {
    /// Sent by the dialing node right after a connection opens.
    pub const HANDSHAKE_REQUEST: MessageType = MessageType(1);

    /// Echoed by the accepting node with its own server info.
    pub const HANDSHAKE_RESPONSE: MessageType = MessageType(2);

    /// Lowest id available to applications.
    pub const FIRST_APPLICATION: MessageType = MessageType(1000);

    /// Creates a message type from its raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.0
    }

    /// Returns true for the two reserved handshake types.
    #[must_use]
    pub const fn is_handshake(&self) -> bool {
        self.0 == Self::HANDSHAKE_REQUEST.0 || self.0 == Self::HANDSHAKE_RESPONSE.0
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MessageType {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

// =============================================================================
// Header
// =============================================================================

/// Fixed header fields of an [`InternalPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Sender for requests, original requester for replies.
    pub node_id: NodeId,

    /// Application or reserved message type.
    pub message_type: MessageType,

    /// Correlation key; [`RequestKey::NONE`] when no reply is expected.
    pub request_key: RequestKey,

    /// True when this packet answers an earlier request.
    pub is_reply: bool,

    /// Target actor inside the receiving node.
    pub actor_id: ActorId,
}

impl PacketHeader {
    fn put(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.node_id.value());
        buf.put_u32_le(self.message_type.id());
        buf.put_u32_le(self.request_key.value());
        buf.put_u8(u8::from(self.is_reply));
        buf.put_u64_le(self.actor_id.value());
    }

    fn get(buf: &mut impl Buf) -> Result<Self, WireError> {
        let node_id = NodeId::new(buf.get_u64_le());
        let message_type = MessageType::new(buf.get_u32_le());
        let request_key = RequestKey::new(buf.get_u32_le());
        let is_reply = match buf.get_u8() {
            0 => false,
            1 => true,
            other => return Err(WireError::InvalidReplyFlag(other)),
        };
        let actor_id = ActorId::new(buf.get_u64_le());

        Ok(Self {
            node_id,
            message_type,
            request_key,
            is_reply,
            actor_id,
        })
    }
}

// =============================================================================
// Packet
// =============================================================================

/// The unit exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalPacket {
    /// Header fields.
    pub header: PacketHeader,

    /// Opaque application payload.
    pub payload: Bytes,
}

impl InternalPacket {
    /// Creates a one-way packet from `source` with no correlation key.
    pub fn new(
        source: NodeId,
        message_type: MessageType,
        actor_id: ActorId,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            header: PacketHeader {
                node_id: source,
                message_type,
                request_key: RequestKey::NONE,
                is_reply: false,
                actor_id,
            },
            payload: payload.into(),
        }
    }

    /// Attaches a correlation key.
    #[must_use]
    pub fn with_request_key(mut self, key: RequestKey) -> Self {
        self.header.request_key = key;
        self
    }

    /// Builds the reply to this packet.
    ///
    /// The reply carries the same key, message type and actor id, and is
    /// addressed to the original sender.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            header: PacketHeader {
                node_id: self.header.node_id,
                message_type: self.header.message_type,
                request_key: self.header.request_key,
                is_reply: true,
                actor_id: self.header.actor_id,
            },
            payload: payload.into(),
        }
    }

    /// Returns the message type.
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Returns the correlation key.
    pub fn request_key(&self) -> RequestKey {
        self.header.request_key
    }

    /// Returns the target actor.
    pub fn actor_id(&self) -> ActorId {
        self.header.actor_id
    }

    /// Returns true if this packet answers an earlier request.
    pub fn is_reply(&self) -> bool {
        self.header.is_reply
    }

    /// The sending node, for requests.
    pub fn source_node_id(&self) -> Option<NodeId> {
        (!self.header.is_reply).then_some(self.header.node_id)
    }

    /// The node the reply is addressed to, for replies.
    pub fn destination_node_id(&self) -> Option<NodeId> {
        self.header.is_reply.then_some(self.header.node_id)
    }

    /// Encodes header and payload into one frame.
    ///
    /// The frame is carved out of the context's scratch buffer so repeated
    /// encodes on one worker reuse the same allocation.
    pub fn encode(&self, ctx: &mut EncodeContext) -> Bytes {
        let buf = ctx.scratch();
        buf.reserve(HEADER_LEN + self.payload.len());
        self.header.put(buf);
        buf.put_slice(&self.payload);
        buf.split().freeze()
    }

    /// Decodes a whole frame without copying the payload.
    pub fn decode(mut frame: Bytes) -> Result<Self, WireError> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                len: frame.len(),
                needed: HEADER_LEN,
            });
        }

        let header = PacketHeader::get(&mut frame)?;
        Ok(Self {
            header,
            payload: frame,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
