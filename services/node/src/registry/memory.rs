//! In-process registry store.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use shoal_id::NodeId;
use tokio::time::Instant;

use super::{RegistryError, RegistryStore};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Registry store held in memory.
///
/// Expiry follows the tokio clock, so paused-time tests can step through TTLs.
/// Share one instance (behind an `Arc`) between nodes of the same process to
/// form a cluster.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<NodeId, Entry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<NodeId, Entry>, Instant) -> T,
    ) -> Result<T, RegistryError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| RegistryError::Unavailable("memory store lock poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(f(&mut entries, now))
    }
}

fn sorted_live(entries: &HashMap<NodeId, Entry>) -> Vec<(NodeId, String)> {
    let mut all: Vec<_> = entries
        .iter()
        .map(|(id, entry)| (*id, entry.value.clone()))
        .collect();
    all.sort_by_key(|(id, _)| *id);
    all
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn put(&self, node_id: NodeId, value: String, ttl: Duration) -> Result<(), RegistryError> {
        self.with_entries(|entries, now| {
            entries.insert(
                node_id,
                Entry {
                    value,
                    expires_at: now + ttl,
                },
            );
        })
    }

    async fn put_and_read_all(
        &self,
        node_id: NodeId,
        value: String,
        ttl: Duration,
    ) -> Result<Vec<(NodeId, String)>, RegistryError> {
        self.with_entries(|entries, now| {
            entries.insert(
                node_id,
                Entry {
                    value,
                    expires_at: now + ttl,
                },
            );
            sorted_live(entries)
        })
    }

    async fn touch(&self, node_id: NodeId, ttl: Duration) -> Result<bool, RegistryError> {
        self.with_entries(|entries, now| match entries.get_mut(&node_id) {
            Some(entry) => {
                entry.expires_at = now + ttl;
                true
            }
            None => false,
        })
    }

    async fn live_ids(&self) -> Result<HashSet<NodeId>, RegistryError> {
        self.with_entries(|entries, _| entries.keys().copied().collect())
    }

    async fn get(&self, node_id: NodeId) -> Result<Option<String>, RegistryError> {
        self.with_entries(|entries, _| entries.get(&node_id).map(|e| e.value.clone()))
    }

    async fn read_all(&self) -> Result<Vec<(NodeId, String)>, RegistryError> {
        self.with_entries(|entries, _| sorted_live(entries))
    }

    async fn remove(&self, node_id: NodeId) -> Result<(), RegistryError> {
        self.with_entries(|entries, _| {
            entries.remove(&node_id);
        })
    }
}
