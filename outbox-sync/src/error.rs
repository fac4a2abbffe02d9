//! Error types for the replay layer.

use outbox_store::StoreError;
use thiserror::Error;

/// Result type for replay operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while configuring or driving the replay engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Queue store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration rejected at build time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),
}
