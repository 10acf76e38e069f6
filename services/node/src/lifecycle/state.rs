//! Node lifecycle states.

use serde::Serialize;

/// Lifecycle of a node.
///
/// ```text
/// Starting -> Joining -> Running -> Stopping -> Stopped
///     │          │                     ^
///     └──────────┴─────────────────────┘  (startup failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Binding the transport and building the local info.
    Starting,
    /// Registering and handshaking with the live nodes.
    Joining,
    /// Heartbeat and reconciliation loops are running.
    Running,
    /// Shutting down.
    Stopping,
    /// Fully stopped.
    Stopped,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Starting => "starting",
            NodeState::Joining => "joining",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        }
    }

    /// Returns true if moving to `next` follows the lifecycle.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Starting, Joining)
                | (Joining, Running)
                | (Starting | Joining | Running, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Returns true once shutdown has begun.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Stopping | NodeState::Stopped)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
