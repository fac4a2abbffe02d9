//! Durable storage for the outbox offline mutation queue.
//!
//! The queue store is the only mutable state shared between the application's
//! enqueue path and the replay engine's drain path. Every method is applied
//! atomically with respect to the others.
//!
//! # Ordering
//!
//! Each entry receives a monotonically increasing sequence number when it is
//! enqueued. [`QueueStore::drain_ordered`] returns a snapshot in that order;
//! entries enqueued after the snapshot was taken are only seen by the next
//! call. Rows that can no longer be decoded are left out of the snapshot;
//! [`QueueStore::quarantine_undecodable`] moves them out of the queue.
//!
//! # Implementations
//!
//! - [`SqliteQueueStore`]: crash-durable, backed by a single SQLite file
//! - [`MemoryQueueStore`]: process-local, for tests and ephemeral hosts

mod error;
mod memory;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryQueueStore;
pub use sqlite::SqliteQueueStore;

use outbox_types::{EntryId, EntryPatch, NewEntry, QueueEntry};

/// A stored row that could not be decoded into a [`QueueEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndecodableEntry {
    /// The id column as stored. It may itself be the malformed part.
    pub id: String,
    pub operation_name: String,
    pub reason: String,
}

impl UndecodableEntry {
    /// The entry id, if the stored one still parses.
    pub fn entry_id(&self) -> Option<EntryId> {
        EntryId::parse(&self.id).ok()
    }
}

/// Persistent, ordered storage of pending mutations.
pub trait QueueStore: Send + Sync {
    /// Appends a new pending entry and returns its freshly assigned id.
    /// When this returns `Ok`, the entry is durable.
    fn enqueue(&self, entry: NewEntry) -> StoreResult<EntryId>;

    /// Returns every decodable stored entry, oldest first.
    fn drain_ordered(&self) -> StoreResult<Vec<QueueEntry>>;

    /// Looks up a single entry.
    fn get(&self, id: &EntryId) -> StoreResult<Option<QueueEntry>>;

    /// Applies a partial update. Fails with `NotFound` if the entry is gone.
    fn update(&self, id: &EntryId, patch: &EntryPatch) -> StoreResult<()>;

    /// Removes an entry. Returns false if it was already absent.
    fn remove(&self, id: &EntryId) -> StoreResult<bool>;

    /// Number of stored entries.
    fn len(&self) -> StoreResult<usize>;

    /// Returns true if no entries are stored.
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Resets entries left `in-flight` by an interrupted replay back to
    /// `pending`. Returns how many were reset.
    fn recover_in_flight(&self) -> StoreResult<usize>;

    /// Moves rows that no longer decode out of the queue and returns them,
    /// oldest first. Stores that only hold decoded entries have none.
    fn quarantine_undecodable(&self) -> StoreResult<Vec<UndecodableEntry>> {
        Ok(Vec::new())
    }
}
