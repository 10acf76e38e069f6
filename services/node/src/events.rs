//! Cluster events published by a running node.
//!
//! Subscribers get a `tokio::sync::broadcast` receiver; slow subscribers
//! miss events rather than slowing the node down.

use serde::Serialize;
use shoal_id::NodeId;

use crate::lifecycle::NodeState;

/// Buffered events per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 256;

/// Why a peer left the local topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Its registry entry expired.
    Expired,
    /// Its link closed.
    Disconnected,
    /// The local node is stopping.
    Shutdown,
}

/// Membership and lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// A peer was added to the topology.
    NodeJoined { node_id: NodeId, group: String },

    /// A peer was removed from the topology.
    NodeLeft { node_id: NodeId, reason: LeaveReason },

    /// The local node changed state.
    StateChanged { from: NodeState, to: NodeState },

    /// The local node found itself missing from the registry.
    SelfEvicted { node_id: NodeId },
}
