//! Error types for recall-memory

use thiserror::Error;

/// Errors that can occur in the memory engine
#[derive(Debug, Error)]
pub enum MemoryError {
    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Serialization error (bincode, edge records)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization error (node properties, audit records, config)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// UUID parsing error
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A node with this primary key already exists
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// An edge endpoint does not exist
    #[error("Dangling reference: {rel} edge {from} -> {to}")]
    DanglingReference {
        rel: String,
        from: String,
        to: String,
    },

    /// The backend could not serve a retrieval
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Empty or invalid retrieval filters
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// Identifier unusable as a storage key
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// Invalid path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Node not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Coordinator used before initialize() or after shutdown()
    #[error("Memory engine not initialized")]
    NotInitialized,

    /// On-disk schema problem
    #[error("Schema error: {0}")]
    Schema(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Builder error
    #[error("Builder error: {0}")]
    Builder(#[from] crate::node::MemoryEntryBuilderError),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MemoryError {
    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create a retrieval unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::RetrievalUnavailable(msg.into())
    }

    /// Create a malformed query error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedQuery(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error came from the storage backend itself
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Io(_) | Self::Bincode(_) | Self::Json(_)
        )
    }
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangling_reference_display() {
        let err = MemoryError::DanglingReference {
            rel: "SUPERSEDES".into(),
            from: "a".into(),
            to: "b".into(),
        };
        assert_eq!(err.to_string(), "Dangling reference: SUPERSEDES edge a -> b");
    }

    #[test]
    fn test_backend_classification() {
        let io = MemoryError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_backend());
        assert!(!MemoryError::malformed("empty").is_backend());
        assert!(!MemoryError::NotInitialized.is_backend());
    }
}
