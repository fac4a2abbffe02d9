//! Core type definitions for the outbox offline mutation queue.
//!
//! This crate defines the plain data shared by the store and the replay
//! engine:
//! - Queue entry identifiers (UUID v7)
//! - The persisted queue entry and its lifecycle status
//! - The operation descriptor a queued mutation is replayed with
//!
//! Record payloads are opaque `serde_json::Value`s. The core never interprets
//! them beyond top-level field access.

mod entry;
mod ids;

pub use entry::{EntryPatch, EntryStatus, NewEntry, Operation, QueueEntry};
pub use ids::EntryId;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid entry status: {0}")]
    InvalidStatus(String),
}
