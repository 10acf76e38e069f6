//! # shoal-id
//!
//! Identifier types shared by every shoal crate.
//!
//! ## Identifier Kinds
//!
//! - [`NodeIdentity`]: opaque bytes a node is addressed by on the transport.
//!   Assigned once at process start and never changed.
//! - [`NodeId`]: 64-bit id derived from the identity by a stable hash. Used as
//!   the registry key, as a map key, and for connection tie-breaking.
//! - [`ActorId`]: 64-bit id of an addressable entity inside a node.
//! - [`RequestKey`]: 32-bit correlation key; zero means "no correlation".
//!
//! Numeric ids format as `{prefix}_{value}` (for example `node_42`) and
//! serialize as plain numbers.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
