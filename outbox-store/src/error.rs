//! Error types for the queue store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Entry not found.
    #[error("entry not found: {0}")]
    NotFound(String),

    /// A persisted row could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A thread panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,
}
