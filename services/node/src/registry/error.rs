//! Registry error types.

use shoal_id::NodeId;
use thiserror::Error;

/// Cluster registry errors.
///
/// Every variant is surfaced to the caller; retry policy belongs to the
/// lifecycle loops, not the registry client.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Failed to connect to the backing store.
    #[error("failed to connect to registry: {0}")]
    Connect(#[source] sqlx::Error),

    /// A store query failed.
    #[error("registry query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// The store is unreachable or refused the call.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The registry URL scheme is not supported.
    #[error("unsupported registry url: {0}")]
    UnsupportedUrl(String),

    /// A stored entry could not be decoded.
    #[error("corrupt registry entry for {node_id}: {source}")]
    Corrupt {
        node_id: NodeId,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
