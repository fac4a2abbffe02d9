//! Queue entry types.
//!
//! A queue entry is a mutation the application issued while disconnected. It
//! is persisted with everything needed to replay it later: the operation, its
//! variables, the optimistic result shown to the UI, and a snapshot of the
//! record it targeted (the conflict base).

use crate::{EntryId, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The mutation a queue entry replays.
///
/// `document` is opaque to the core; only the transport interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation name, used to route cache updates and conflict handling.
    pub name: String,
    /// The mutation document as the transport understands it.
    #[serde(default)]
    pub document: String,
}

impl Operation {
    /// Creates an operation descriptor.
    pub fn new(name: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            document: document.into(),
        }
    }

    /// Creates an operation descriptor with no document body.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, String::new())
    }
}

/// Lifecycle status of a queue entry.
///
/// Terminal entries (`Resolved`, `Failed`) are removed from the store, so a
/// persisted entry is normally `Pending`, or `InFlight` while its submission
/// is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    Resolved,
    Failed,
}

impl EntryStatus {
    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Resolved` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-flight" => Ok(Self::InFlight),
            "resolved" => Ok(Self::Resolved),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

/// A queued mutation awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique id, assigned by the store at enqueue time. Never reused.
    pub id: EntryId,

    /// The mutation to replay.
    pub operation: Operation,

    /// The mutation's input payload. Replaced only by a merged resubmission.
    pub variables: Value,

    /// Locally synthesized result shown before backend confirmation.
    #[serde(default)]
    pub optimistic_response: Option<Value>,

    /// Snapshot of the target record at enqueue time.
    #[serde(default)]
    pub conflict_base: Option<Value>,

    /// Logical type name of the mutated entity.
    #[serde(default)]
    pub return_type: Option<String>,

    /// Current lifecycle status.
    pub status: EntryStatus,

    /// Number of submissions attempted so far, across replay passes.
    #[serde(default)]
    pub attempts: u32,

    /// Whether a conflict on this entry has already been resolved once.
    #[serde(default)]
    pub merged: bool,

    /// When the entry was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Materializes a new pending entry from an enqueue request.
    #[must_use]
    pub fn from_new(id: EntryId, new: NewEntry) -> Self {
        Self {
            id,
            operation: new.operation,
            variables: new.variables,
            optimistic_response: new.optimistic_response,
            conflict_base: new.conflict_base,
            return_type: new.return_type,
            status: EntryStatus::Pending,
            attempts: 0,
            merged: false,
            enqueued_at: Utc::now(),
        }
    }

    /// Returns the operation name.
    pub fn operation_name(&self) -> &str {
        &self.operation.name
    }

    /// Applies a patch in place.
    pub fn apply(&mut self, patch: &EntryPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(variables) = &patch.variables {
            self.variables = variables.clone();
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }
        if let Some(merged) = patch.merged {
            self.merged = merged;
        }
    }
}

/// An enqueue request: a queue entry before the store has assigned its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub operation: Operation,
    pub variables: Value,
    pub optimistic_response: Option<Value>,
    pub conflict_base: Option<Value>,
    pub return_type: Option<String>,
}

impl NewEntry {
    /// Creates an enqueue request with only an operation and its variables.
    pub fn new(operation: Operation, variables: Value) -> Self {
        Self {
            operation,
            variables,
            optimistic_response: None,
            conflict_base: None,
            return_type: None,
        }
    }

    /// Sets the conflict base snapshot.
    #[must_use]
    pub fn with_conflict_base(mut self, base: Value) -> Self {
        self.conflict_base = Some(base);
        self
    }

    /// Sets the return type name.
    #[must_use]
    pub fn with_return_type(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = Some(return_type.into());
        self
    }

    /// Sets an explicit optimistic response.
    #[must_use]
    pub fn with_optimistic_response(mut self, response: Value) -> Self {
        self.optimistic_response = Some(response);
        self
    }
}

/// A partial update to a persisted entry. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPatch {
    pub status: Option<EntryStatus>,
    pub variables: Option<Value>,
    pub attempts: Option<u32>,
    pub merged: Option<bool>,
}

impl EntryPatch {
    /// A patch that only changes the status.
    #[must_use]
    pub fn status(status: EntryStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.variables.is_none()
            && self.attempts.is_none()
            && self.merged.is_none()
    }
}
