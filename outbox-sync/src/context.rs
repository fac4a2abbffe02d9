//! Replay context attached to every resubmitted mutation.

use outbox_types::{EntryId, QueueEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Extra information handed to the transport alongside a replayed mutation,
/// so it can tell replays apart from live mutations and see the conflict
/// base the client started from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayContext {
    pub is_offline: bool,
    pub offline_id: EntryId,
    pub conflict_base: Option<Value>,
    pub return_type: Option<String>,
}

impl ReplayContext {
    /// Whether the mutation came out of the offline queue.
    pub fn is_marked_offline(&self) -> bool {
        self.is_offline
    }
}

/// Builds the replay context for a queue entry.
pub fn replay_context(entry: &QueueEntry) -> ReplayContext {
    ReplayContext {
        is_offline: true,
        offline_id: entry.id,
        conflict_base: entry.conflict_base.clone(),
        return_type: entry.return_type.clone(),
    }
}
