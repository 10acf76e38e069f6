//! Cluster registry client.
//!
//! The registry is a shared key-value collection keyed by node id. Each
//! entry holds a serialized [`ServerInfo`] and carries its own TTL, so one
//! node expiring never affects the visibility of another. A node stays
//! "live" only as long as it keeps refreshing its TTL.
//!
//! Backends implement [`RegistryStore`]:
//! - [`MemoryStore`]: in-process, tokio clock based; tests and single-host dev
//! - [`PostgresStore`]: shared table with per-row expiry
//!
//! The client holds no cached state. Errors propagate to the caller, which
//! decides the retry policy.

mod error;
mod memory;
mod postgres;

pub use error::RegistryError;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shoal_id::NodeId;
use tracing::{debug, warn};

use crate::server_info::ServerInfo;

// =============================================================================
// Store Trait
// =============================================================================

/// Backing store of the registry collection.
///
/// Values are opaque strings. Every read only returns entries whose TTL has
/// not expired.
#[async_trait]
pub trait RegistryStore: Send + Sync + 'static {
    /// Writes an entry and sets its TTL.
    async fn put(&self, node_id: NodeId, value: String, ttl: Duration) -> Result<(), RegistryError>;

    /// Writes an entry, sets its TTL and reads all live entries, atomically.
    async fn put_and_read_all(
        &self,
        node_id: NodeId,
        value: String,
        ttl: Duration,
    ) -> Result<Vec<(NodeId, String)>, RegistryError>;

    /// Refreshes the TTL of a live entry without rewriting it.
    ///
    /// Returns false if the entry is missing or already expired.
    async fn touch(&self, node_id: NodeId, ttl: Duration) -> Result<bool, RegistryError>;

    /// Ids of all live entries.
    async fn live_ids(&self) -> Result<HashSet<NodeId>, RegistryError>;

    /// Reads one live entry.
    async fn get(&self, node_id: NodeId) -> Result<Option<String>, RegistryError>;

    /// Reads all live entries.
    async fn read_all(&self) -> Result<Vec<(NodeId, String)>, RegistryError>;

    /// Deletes an entry.
    async fn remove(&self, node_id: NodeId) -> Result<(), RegistryError>;
}

/// Opens the store named by a registry URL.
///
/// `memory://` yields a fresh [`MemoryStore`]; `postgres://` and
/// `postgresql://` connect a [`PostgresStore`] scoped to `cluster`.
pub async fn connect_store(url: &str, cluster: &str) -> Result<Arc<dyn RegistryStore>, RegistryError> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PostgresStore::connect(url, cluster).await?;
        return Ok(Arc::new(store));
    }

    Err(RegistryError::UnsupportedUrl(url.to_string()))
}

// =============================================================================
// Client
// =============================================================================

/// Typed client over a [`RegistryStore`].
#[derive(Clone)]
pub struct ClusterRegistry {
    store: Arc<dyn RegistryStore>,
}

impl ClusterRegistry {
    /// Create a registry client.
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    /// Registers `info` and returns every other live node, in one atomic
    /// store operation.
    pub async fn register_and_get_others(
        &self,
        info: &ServerInfo,
        ttl: Duration,
    ) -> Result<Vec<ServerInfo>, RegistryError> {
        let value = serde_json::to_string(info)?;
        let entries = self
            .store
            .put_and_read_all(info.node_id, value, ttl)
            .await?;

        let others = decode_entries(entries)
            .into_iter()
            .filter(|other| other.node_id != info.node_id)
            .collect::<Vec<_>>();

        debug!(
            node_id = %info.node_id,
            others = others.len(),
            ttl_secs = ttl.as_secs(),
            "Registered and fetched live nodes"
        );

        Ok(others)
    }

    /// Registers `info` with the given TTL.
    pub async fn register_self(&self, info: &ServerInfo, ttl: Duration) -> Result<(), RegistryError> {
        let value = serde_json::to_string(info)?;
        self.store.put(info.node_id, value, ttl).await
    }

    /// Refreshes the TTL of a node entry.
    ///
    /// Returns false if the entry had already expired.
    pub async fn update_heartbeat(&self, node_id: NodeId, ttl: Duration) -> Result<bool, RegistryError> {
        self.store.touch(node_id, ttl).await
    }

    /// Ids of every node whose TTL has not expired.
    pub async fn live_node_ids(&self) -> Result<HashSet<NodeId>, RegistryError> {
        self.store.live_ids().await
    }

    /// Every live node except `exclude`.
    pub async fn other_live_nodes(&self, exclude: NodeId) -> Result<Vec<ServerInfo>, RegistryError> {
        let entries = self.store.read_all().await?;
        Ok(decode_entries(entries)
            .into_iter()
            .filter(|info| info.node_id != exclude)
            .collect())
    }

    /// Published info of one live node.
    pub async fn node_info(&self, node_id: NodeId) -> Result<Option<ServerInfo>, RegistryError> {
        match self.store.get(node_id).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| RegistryError::Corrupt { node_id, source }),
            None => Ok(None),
        }
    }

    /// Removes a node entry.
    pub async fn unregister(&self, node_id: NodeId) -> Result<(), RegistryError> {
        self.store.remove(node_id).await
    }
}

/// Decodes entries, skipping (and logging) any that fail to parse.
fn decode_entries(entries: Vec<(NodeId, String)>) -> Vec<ServerInfo> {
    entries
        .into_iter()
        .filter_map(|(node_id, raw)| match serde_json::from_str::<ServerInfo>(&raw) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Skipping corrupt registry entry");
                None
            }
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
