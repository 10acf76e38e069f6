//! Local view of the remote nodes this node is connected to.
//!
//! Nodes are indexed twice: by node id and by group name (the API name for
//! SubApi nodes, the kind otherwise). Both views always hold the same set.
//! Each group has a round-robin cursor used by [`TopologyManager::round_robin`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shoal_id::{NodeId, NodeIdentity};
use tracing::debug;

use crate::server_info::{NodeKind, ServerInfo, Stickiness};

/// Round-robin cursors reset to zero once they pass this bound.
const CURSOR_WRAP: u32 = i32::MAX as u32;

// =============================================================================
// Remote Node
// =============================================================================

/// A connected peer.
#[derive(Debug)]
pub struct RemoteNode {
    info: ServerInfo,
    closed: AtomicBool,
}

impl RemoteNode {
    /// Wraps the info a peer published.
    pub fn new(info: ServerInfo) -> Self {
        Self {
            info,
            closed: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn node_id(&self) -> NodeId {
        self.info.node_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.info.identity
    }

    /// Topology group of the peer.
    pub fn group(&self) -> &str {
        self.info.group_name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the peer closed. Returns true for the first caller only.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Static attributes of a group, recorded from its first member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupAttributes {
    pub kind: NodeKind,
    pub stickiness: Stickiness,
}

// =============================================================================
// Topology Manager
// =============================================================================

/// Concurrent topology cache.
#[derive(Debug, Default)]
pub struct TopologyManager {
    by_id: DashMap<NodeId, Arc<RemoteNode>>,
    by_group: DashMap<String, BTreeMap<NodeId, Arc<RemoteNode>>>,
    cursors: DashMap<String, Arc<AtomicU32>>,
    attributes: DashMap<String, GroupAttributes>,
}

impl TopologyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer to both views.
    ///
    /// Returns false (and changes nothing) if the node id is already known.
    pub fn try_add(&self, node: Arc<RemoteNode>) -> bool {
        let node_id = node.node_id();
        let group = node.group().to_string();

        match self.by_id.entry(node_id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                // The id slot stays locked until the group view has the node too.
                let _held = slot.insert(Arc::clone(&node));
                self.by_group
                    .entry(group.clone())
                    .or_default()
                    .insert(node_id, Arc::clone(&node));
            }
        }

        self.attributes
            .entry(group.clone())
            .or_insert_with(|| GroupAttributes {
                kind: node.info().kind,
                stickiness: node.info().stickiness,
            });

        debug!(node_id = %node_id, group = %group, "Added node to topology");
        true
    }

    /// Removes a peer from both views.
    ///
    /// Only the exact node found under `node_id` leaves the group view, so a
    /// concurrent re-add of the same id is never half undone.
    pub fn try_remove(&self, node_id: NodeId) -> Option<Arc<RemoteNode>> {
        let Entry::Occupied(slot) = self.by_id.entry(node_id) else {
            return None;
        };

        // The id slot stays locked until the group view has dropped the node.
        let node = Arc::clone(slot.get());
        let group = node.group();
        if let Some(mut members) = self.by_group.get_mut(group) {
            if members.get(&node_id).is_some_and(|member| Arc::ptr_eq(member, &node)) {
                members.remove(&node_id);
            }
        }
        self.by_group.remove_if(group, |_, members| members.is_empty());
        slot.remove();

        debug!(node_id = %node_id, group = %group, "Removed node from topology");
        Some(node)
    }

    /// Next member of `group` in round-robin order.
    ///
    /// Returns None if the group is unknown or empty.
    pub fn round_robin(&self, group: &str) -> Option<Arc<RemoteNode>> {
        let members: Vec<Arc<RemoteNode>> = self
            .by_group
            .get(group)?
            .values()
            .cloned()
            .collect();
        if members.is_empty() {
            return None;
        }

        let cursor = Arc::clone(self.cursors.entry(group.to_string()).or_default().value());
        let position = cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current >= CURSOR_WRAP { 0 } else { current + 1 })
            })
            .unwrap_or(0);

        let index = position as usize % members.len();
        Some(Arc::clone(&members[index]))
    }

    pub fn get(&self, node_id: NodeId) -> Option<Arc<RemoteNode>> {
        self.by_id.get(&node_id).map(|node| Arc::clone(node.value()))
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.by_id.contains_key(&node_id)
    }

    /// Ids of every known peer.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.by_id.iter().map(|node| *node.key()).collect();
        ids.sort();
        ids
    }

    /// Members of one group, ordered by node id.
    pub fn group_members(&self, group: &str) -> Vec<Arc<RemoteNode>> {
        self.by_group
            .get(group)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn group_attributes(&self, group: &str) -> Option<GroupAttributes> {
        self.attributes.get(group).map(|attrs| *attrs.value())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Removes every peer and returns them.
    pub fn drain(&self) -> Vec<Arc<RemoteNode>> {
        self.node_ids()
            .into_iter()
            .filter_map(|id| self.try_remove(id))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
