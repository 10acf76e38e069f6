//! Published description of a node.
//!
//! A [`ServerInfo`] is built once at startup, written to the cluster
//! registry and sent in handshakes. It is never mutated after publication.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shoal_id::{NodeId, NodeIdentity};

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Client-facing gateway.
    Gateway,
    /// Primary API node.
    MainApi,
    /// Member of a named API group.
    SubApi,
}

impl NodeKind {
    /// Snake-case name, also used as identity prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Gateway => "gateway",
            NodeKind::MainApi => "main_api",
            NodeKind::SubApi => "sub_api",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gateway" => Ok(NodeKind::Gateway),
            "main_api" | "mainapi" => Ok(NodeKind::MainApi),
            "sub_api" | "subapi" => Ok(NodeKind::SubApi),
            other => Err(format!("unknown node kind: {other}")),
        }
    }
}

/// Whether requests for one entity must keep landing on the same node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stickiness {
    /// Any node of the group may serve any request.
    #[default]
    Stateless,
    /// Entities are pinned to the node that created them.
    Sticky,
}

impl FromStr for Stickiness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stateless" => Ok(Stickiness::Stateless),
            "sticky" => Ok(Stickiness::Sticky),
            other => Err(format!("unknown stickiness: {other}")),
        }
    }
}

/// Registry and handshake record for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Numeric id derived from `identity`.
    pub node_id: NodeId,

    /// Transport identity.
    pub identity: NodeIdentity,

    /// Node role.
    pub kind: NodeKind,

    /// Logical API name; empty unless `kind` is [`NodeKind::SubApi`].
    #[serde(default)]
    pub api_name: String,

    /// Stickiness policy of the API group.
    #[serde(default)]
    pub stickiness: Stickiness,

    /// Reachable address, `tcp://host:port`.
    pub address: String,

    /// When the node process started.
    pub started_at: DateTime<Utc>,
}

impl ServerInfo {
    /// Builds the record for a node listening on `host:port`.
    pub fn new(
        identity: NodeIdentity,
        kind: NodeKind,
        api_name: impl Into<String>,
        stickiness: Stickiness,
        host: &str,
        port: u16,
    ) -> Self {
        Self {
            node_id: identity.node_id(),
            identity,
            kind,
            api_name: api_name.into(),
            stickiness,
            address: format!("tcp://{host}:{port}"),
            started_at: Utc::now(),
        }
    }

    /// Name of the topology group this node belongs to.
    ///
    /// SubApi nodes group by API name; other kinds group by their kind.
    pub fn group_name(&self) -> &str {
        match self.kind {
            NodeKind::SubApi if !self.api_name.is_empty() => &self.api_name,
            kind => kind.as_str(),
        }
    }
}
