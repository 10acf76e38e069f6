//! Typed ID definitions for cluster nodes, actors and requests.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::define_numeric_id;

// =============================================================================
// Numeric IDs
// =============================================================================

define_numeric_id!(NodeId, u64, "node");
define_numeric_id!(ActorId, u64, "actor");
define_numeric_id!(RequestKey, u32, "req");

impl RequestKey {
    /// The key carried by packets that expect no correlated reply.
    pub const NONE: RequestKey = RequestKey(0);

    /// Returns true if this key does not correlate to a pending request.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

// =============================================================================
// Node Identity
// =============================================================================

/// Opaque transport address of a node.
///
/// The identity is a byte string exchanged when two nodes connect. Cloning is
/// cheap; the bytes are reference counted.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIdentity(Bytes);

impl NodeIdentity {
    /// Generates a fresh identity of the form `{prefix}_{ulid}`.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(Bytes::from(format!("{}_{}", prefix, crate::Ulid::new())))
    }

    /// Wraps existing identity bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw identity bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the identity as a shared buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Returns true if the identity has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Derives the numeric node id: the first 8 bytes of SHA-256 over the
    /// identity, big-endian.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        let digest = Sha256::digest(&self.0);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        NodeId::new(u64::from_be_bytes(head))
    }

    /// Hex encoding of the identity bytes.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parses a hex encoded identity.
    pub fn from_hex(s: &str) -> Result<Self, crate::IdError> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }
        hex::decode(s)
            .map(|raw| Self(Bytes::from(raw)))
            .map_err(|e| crate::IdError::InvalidIdentity(e.to_string()))
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => f.write_str(s),
            _ => write!(f, "0x{}", self.to_hex()),
        }
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeIdentity({self})")
    }
}

impl serde::Serialize for NodeIdentity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for NodeIdentity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Key Sequence
// =============================================================================

/// Lock-free generator for [`RequestKey`]s.
///
/// Keys increase by one, wrap at `u32::MAX` and never yield zero.
#[derive(Debug, Default)]
pub struct KeySequence {
    last: AtomicU32,
}

impl KeySequence {
    /// Creates a sequence whose first key is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicU32::new(0),
        }
    }

    /// Creates a sequence that continues after `last`.
    #[must_use]
    pub const fn starting_after(last: u32) -> Self {
        Self {
            last: AtomicU32::new(last),
        }
    }

    /// Returns the next key.
    pub fn next_key(&self) -> RequestKey {
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let next = match current.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return RequestKey::new(next),
                Err(observed) => current = observed,
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
