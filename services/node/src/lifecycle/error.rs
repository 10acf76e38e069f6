//! Node service errors.

use shoal_id::NodeId;
use shoal_wire::WireError;
use thiserror::Error;

use super::NodeState;
use crate::correlation::RequestError;
use crate::registry::RegistryError;
use crate::transport::TransportError;

/// Errors surfaced by [`super::NodeService`].
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Wire(#[from] WireError),

    /// The node is not in the local topology.
    #[error("node {0} is not connected")]
    UnknownNode(NodeId),

    /// No connected node serves the API group.
    #[error("no connected node for api {0}")]
    NoNodeForApi(String),

    /// The peer answered a handshake with another node's info.
    #[error("handshake with {address} returned node {actual}, expected {expected}")]
    IdentityMismatch {
        address: String,
        expected: NodeId,
        actual: NodeId,
    },

    /// The operation is not valid in the current state.
    #[error("node is {0}")]
    InvalidState(NodeState),
}
