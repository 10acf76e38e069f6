//! Transport errors.

use std::time::Duration;

use shoal_id::NodeIdentity;
use shoal_wire::WireError;
use thiserror::Error;

/// Errors raised by the node transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Binding failed for a reason other than the port being taken.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Every candidate port was in use.
    #[error("no free port on {host} after {attempts} attempts starting at {first_port}")]
    PortsExhausted {
        host: String,
        first_port: u16,
        attempts: u32,
    },

    /// The address is not `tcp://host:port`.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Opening the connection failed.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer did not send its identity frame.
    #[error("identity exchange with {address} failed: {reason}")]
    IdentityExchange { address: String, reason: String },

    /// A single handshake attempt got no response in time.
    #[error("handshake with {peer} timed out after {timeout:?}")]
    HandshakeTimeout { peer: NodeIdentity, timeout: Duration },

    /// Every handshake attempt failed.
    #[error("handshake with {address} failed after {attempts} attempts: {last_error}")]
    HandshakeFailed {
        address: String,
        attempts: u32,
        last_error: String,
    },

    /// No link to the peer.
    #[error("peer {0} is not connected")]
    NotConnected(NodeIdentity),

    /// The link's send queue is full; the peer is not keeping up.
    #[error("send queue to {0} is full")]
    SendQueueFull(NodeIdentity),

    /// A single frame write made no progress in time.
    #[error("write to {peer} stalled for {timeout:?}")]
    WriteTimeout { peer: NodeIdentity, timeout: Duration },

    /// The link failed while the packet was still queued.
    #[error("link to {peer} failed: {reason}")]
    LinkFailed { peer: NodeIdentity, reason: String },

    /// Socket IO failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be decoded.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The transport is shut down.
    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    /// Returns true for errors worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::IdentityExchange { .. }
                | TransportError::HandshakeTimeout { .. }
                | TransportError::NotConnected(_)
                | TransportError::SendQueueFull(_)
                | TransportError::WriteTimeout { .. }
                | TransportError::LinkFailed { .. }
                | TransportError::Io(_)
        )
    }
}
