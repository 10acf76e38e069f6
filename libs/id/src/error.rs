//! Errors raised when parsing identifiers.

use thiserror::Error;

/// Parse failures for numeric ids and node identities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Nothing to parse.
    #[error("empty id")]
    Empty,

    /// The text names another id kind, e.g. `actor_7` parsed as a node id.
    #[error("expected '{expected}_' prefix, found '{actual}_'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The digits after the prefix do not fit the id's integer type.
    #[error("bad id number: {0}")]
    InvalidNumber(String),

    /// A node identity was not valid hex.
    #[error("bad node identity hex: {0}")]
    InvalidIdentity(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
