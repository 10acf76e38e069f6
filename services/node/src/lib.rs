//! shoal node runtime library
//!
//! A node is one process of a shoal cluster. Nodes find each other through
//! a shared registry with per-entry TTLs, connect over TCP with an identity
//! exchange plus handshake, and route application packets to per-entity
//! actors that process their messages strictly in order.
//!
//! ## Architecture
//!
//! ```text
//! NodeService
//! ├── ClusterRegistry      (register, heartbeat TTL, live set)
//! ├── NodeTransport        (listener, links, handshakes)
//! │   └── InboundRouter    (replies -> CorrelationTable, requests -> controller)
//! ├── TopologyManager      (connected peers by id and by API group)
//! ├── heartbeat loop
//! └── reconciliation loop
//!
//! EventController
//! ├── StatelessController  (task per packet, reply with result)
//! └── StatefulController   (ActorManager of entity actors)
//! ```
//!
//! ## Modules
//!
//! - `registry`: registry client and backends (memory, Postgres)
//! - `transport`: node-to-node links and handshakes
//! - `correlation`: request/response matching with timeouts
//! - `topology`: connected peers and round-robin selection
//! - `actors`: ordered mailboxes and the actor manager
//! - `controller`: routing of inbound packets
//! - `lifecycle`: the node service and its loops

pub mod actors;
pub mod config;
pub mod controller;
pub mod correlation;
pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod server_info;
pub mod topology;
pub mod transport;

// Re-export commonly used types
pub use config::NodeConfig;
pub use controller::{
    ActorMessage, DispatchError, DispatchOutcome, EventController, RoutingTable, StatefulController,
    StatelessController,
};
pub use correlation::{CorrelationTable, RequestError};
pub use events::ClusterEvent;
pub use lifecycle::{NodeError, NodeService, NodeState};
pub use registry::{ClusterRegistry, MemoryStore, RegistryStore};
pub use server_info::{NodeKind, ServerInfo, Stickiness};
pub use topology::{RemoteNode, TopologyManager};
pub use transport::{NodeTransport, TransportConfig, TransportError};
