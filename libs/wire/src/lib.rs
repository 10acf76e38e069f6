//! # shoal-wire
//!
//! The unit exchanged between nodes is an [`InternalPacket`]: a fixed
//! little-endian header followed by an opaque payload.
//!
//! ```text
//! +---------+--------------+-------------+-------+----------+---------+
//! | node id | message type | request key | reply | actor id | payload |
//! |   8     |      4       |      4      |   1   |    8     |    N    |
//! +---------+--------------+-------------+-------+----------+---------+
//! ```
//!
//! The node id is the sender for requests and the original requester for
//! replies. Message types [`MessageType::HANDSHAKE_REQUEST`] and
//! [`MessageType::HANDSHAKE_RESPONSE`] are reserved; everything from
//! [`MessageType::FIRST_APPLICATION`] up belongs to applications.
//!
//! Framing (length prefixes) is the transport's job; this crate only sees
//! whole frames.

mod codec;
mod error;
mod packet;

pub use codec::{EncodeContext, JsonCodec, PayloadCodec};
pub use error::WireError;
pub use packet::{InternalPacket, MessageType, PacketHeader, HEADER_LEN};
