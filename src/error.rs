use std::io;
use thiserror::Error;

/// Result type used throughout the runtime.
pub type NodeResult<T> = Result<T, NodeError>;

/// Unified error type for the node runtime.
///
/// The first group of variants is the runtime's own taxonomy: retrieval
/// failures are recoverable and left to the caller, integrity failures are
/// always propagated, usage failures report an operation that is invalid for
/// the node in its current mode. The remaining variants wrap the collaborators
/// (SQL executor, sockets, codecs, configuration).
#[derive(Error, Debug)]
pub enum NodeError {
    /// A query returned no rows where one was required, or its table is missing
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Data or schema would be left inconsistent
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Operation is not valid for this node
    #[error("Usage error: {0}")]
    Usage(String),

    /// Request rejected by the access policy
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A live discoverable registration already exists for this identity
    #[error("Duplicate discoverable registration: {0}")]
    DuplicateDiscoverable(String),

    /// Target is no longer routable
    #[error("Target is dead: {0}")]
    Dead(String),

    /// The remote side failed while handling a request
    #[error("Remote error: {0}")]
    Remote(String),

    /// Errors raised by the SQL executor
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Errors related to IO operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Wire encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors related to configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl NodeError {
    /// Whether this is the recoverable "nothing found" class of error.
    pub fn is_retrieval(&self) -> bool {
        matches!(self, NodeError::Retrieval(_))
    }

    /// Whether this error came from a missing table rather than an empty result.
    pub fn is_missing_table(&self) -> bool {
        match self {
            NodeError::Database(e) => e.to_string().contains("no such table"),
            NodeError::Retrieval(msg) => msg.starts_with("no such table"),
            _ => false,
        }
    }
}

impl From<rmp_serde::encode::Error> for NodeError {
    fn from(error: rmp_serde::encode::Error) -> Self {
        NodeError::Codec(error.to_string())
    }
}

impl From<rmp_serde::decode::Error> for NodeError {
    fn from(error: rmp_serde::decode::Error) -> Self {
        NodeError::Codec(error.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(error: toml::de::Error) -> Self {
        NodeError::Config(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_errors_are_recoverable() {
        assert!(NodeError::Retrieval("no rows".into()).is_retrieval());
        assert!(!NodeError::Integrity("dropped column".into()).is_retrieval());
    }

    #[test]
    fn display_carries_category() {
        let err = NodeError::Remote("boom".into());
        assert_eq!(err.to_string(), "Remote error: boom");
    }
}
