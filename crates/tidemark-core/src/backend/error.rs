//! Storage backend error types.

use thiserror::Error;

/// Errors raised by a [`StorageBackend`](super::StorageBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A table with this name already exists.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// The secondary index does not exist.
    #[error("index not found: {table}.{index}")]
    IndexNotFound {
        /// Table owning the index.
        table: String,
        /// Index name.
        index: String,
    },

    /// A secondary index with this name already exists.
    #[error("index already exists: {table}.{index}")]
    IndexExists {
        /// Table owning the index.
        table: String,
        /// Index name.
        index: String,
    },

    /// The backup does not exist.
    #[error("backup not found: {0}")]
    BackupNotFound(String),

    /// A batched write exceeded the per-call item limit.
    #[error("batch of {size} items exceeds the limit of {limit}")]
    BatchTooLarge {
        /// Number of items submitted.
        size: usize,
        /// Maximum number of items per call.
        limit: usize,
    },

    /// An item does not carry one of the table's key attributes.
    #[error("item is missing key attribute '{attribute}' for table {table}")]
    MissingKey {
        /// Table being written.
        table: String,
        /// Key attribute that was absent.
        attribute: String,
    },

    /// A scan continuation token could not be decoded.
    #[error("invalid continuation token: {0}")]
    InvalidToken(String),

    /// Underlying sled storage error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Item or metadata encoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend rejected or failed the request.
    #[error("backend request failed: {0}")]
    Request(String),
}

impl BackendError {
    /// Whether this error reports a missing table.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::TableNotFound(_))
    }
}
