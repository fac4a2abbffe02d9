//! Observer hooks fired by the replay engine.
//!
//! Listeners are output only: they run synchronously at the matching state
//! transition, in submission order, and cannot influence the replay.

use outbox_store::UndecodableEntry;
use outbox_types::{EntryId, QueueEntry};
use serde_json::Value;
use thiserror::Error;

/// Why an entry ended in the `failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayFailure {
    /// The backend rejected the mutation.
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// The conflict strategy declined to merge.
    #[error("unresolved conflict: {0}")]
    Unresolved(String),

    /// The merged resubmission conflicted again.
    #[error("conflict on merged resubmission")]
    ConflictAfterMerge,

    /// The configured transient retry bound was reached.
    #[error("gave up after {attempts} transient failures: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    /// The stored entry could no longer be read and was quarantined.
    #[error("stored entry could not be decoded: {0}")]
    Undecodable(String),
}

/// Terminal outcome of one entry, delivered to [`watch`] callers.
///
/// [`watch`]: crate::ReplayEngine::watch
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// Accepted by the backend; carries the server's result.
    Resolved(Value),
    Failed(ReplayFailure),
}

/// A conflict observed during replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEvent {
    pub entry_id: EntryId,
    pub operation_name: String,
    /// Snapshot captured at enqueue time, `Null` if none.
    pub base: Value,
    pub server_data: Value,
    pub client_data: Value,
    /// The record resubmitted, if the strategy produced one.
    pub merged: Option<Value>,
    /// Fields both sides changed to different values.
    pub conflicting_fields: Vec<String>,
}

/// Per-entry success and failure notifications.
pub trait OfflineQueueListener: Send + Sync {
    /// The backend accepted the entry. `result` is what it returned, after
    /// the cache has been reconciled with it.
    fn on_operation_success(&self, _entry: &QueueEntry, _result: &Value) {}

    /// The entry was removed from the queue without being applied.
    fn on_operation_failure(&self, _entry: &QueueEntry, _failure: &ReplayFailure) {}

    /// A stored row could not be decoded and was moved out of the queue.
    /// Its waiters, if the id survived, get [`ReplayFailure::Undecodable`].
    fn on_operation_undecodable(&self, _entry: &UndecodableEntry) {}
}

/// Conflict and merge notifications.
pub trait ConflictListener: Send + Sync {
    /// Both sides changed the same field to different values, the strategy
    /// gave up, or a merged resubmission conflicted again.
    fn conflict_occurred(&self, _event: &ConflictEvent) {}

    /// Concurrent edits touched disjoint fields and were combined.
    fn merge_occurred(&self, _event: &ConflictEvent) {}
}

/// Listeners that record every call, for tests.
pub mod recording {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    /// One recorded notification.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Recorded {
        Success { entry_id: EntryId, result: Value },
        Failure { entry_id: EntryId, failure: ReplayFailure },
        Conflict(ConflictEvent),
        Merge(ConflictEvent),
        Undecodable(UndecodableEntry),
    }

    /// Implements both listener traits and keeps every call in order.
    #[derive(Default)]
    pub struct RecordingListener {
        calls: Mutex<Vec<Recorded>>,
    }

    impl RecordingListener {
        /// Creates a listener with nothing recorded.
        pub fn new() -> Self {
            Self::default()
        }

        fn calls_mut(&self) -> MutexGuard<'_, Vec<Recorded>> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Every call so far, in the order received.
        pub fn calls(&self) -> Vec<Recorded> {
            self.calls_mut().clone()
        }

        /// Entry ids and results from `on_operation_success`.
        pub fn successes(&self) -> Vec<(EntryId, Value)> {
            self.calls_mut()
                .iter()
                .filter_map(|c| match c {
                    Recorded::Success { entry_id, result } => Some((*entry_id, result.clone())),
                    _ => None,
                })
                .collect()
        }

        /// Entry ids and reasons from `on_operation_failure`.
        pub fn failures(&self) -> Vec<(EntryId, ReplayFailure)> {
            self.calls_mut()
                .iter()
                .filter_map(|c| match c {
                    Recorded::Failure { entry_id, failure } => Some((*entry_id, failure.clone())),
                    _ => None,
                })
                .collect()
        }

        /// Events from `conflict_occurred`.
        pub fn conflicts(&self) -> Vec<ConflictEvent> {
            self.calls_mut()
                .iter()
                .filter_map(|c| match c {
                    Recorded::Conflict(e) => Some(e.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Events from `merge_occurred`.
        pub fn merges(&self) -> Vec<ConflictEvent> {
            self.calls_mut()
                .iter()
                .filter_map(|c| match c {
                    Recorded::Merge(e) => Some(e.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Rows from `on_operation_undecodable`.
        pub fn undecodable(&self) -> Vec<UndecodableEntry> {
            self.calls_mut()
                .iter()
                .filter_map(|c| match c {
                    Recorded::Undecodable(row) => Some(row.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl OfflineQueueListener for RecordingListener {
        fn on_operation_success(&self, entry: &QueueEntry, result: &Value) {
            self.calls_mut().push(Recorded::Success {
                entry_id: entry.id,
                result: result.clone(),
            });
        }

        fn on_operation_failure(&self, entry: &QueueEntry, failure: &ReplayFailure) {
            self.calls_mut().push(Recorded::Failure {
                entry_id: entry.id,
                failure: failure.clone(),
            });
        }

        fn on_operation_undecodable(&self, entry: &UndecodableEntry) {
            self.calls_mut().push(Recorded::Undecodable(entry.clone()));
        }
    }

    impl ConflictListener for RecordingListener {
        fn conflict_occurred(&self, event: &ConflictEvent) {
            self.calls_mut().push(Recorded::Conflict(event.clone()));
        }

        fn merge_occurred(&self, event: &ConflictEvent) {
            self.calls_mut().push(Recorded::Merge(event.clone()));
        }
    }
}
