//! Conflict detection and resolution.
//!
//! Detection is a routing step: the transport has already classified the
//! backend's answer, [`ConflictDetector`] turns that classification into the
//! engine's next move.
//!
//! Resolution is a single pluggable [`ConflictStrategy`] invoked with the
//! base snapshot, the server's current record, and the client's variables.
//! [`analyze`] is the three-way field comparison the engine uses to tell a
//! mergeable conflict (edits to disjoint fields) from a hard one.

use crate::transport::SubmitOutcome;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// What the engine does next with a submitted entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Accepted. Reconcile the cache and drop the entry.
    Commit(Value),
    /// Version conflict. Resolve against the server's record.
    Resolve(Value),
    /// Backend unreachable. Keep the entry and halt the pass.
    Retry(String),
    /// Rejected for good. Drop the entry and move on.
    Reject(String),
}

/// Routes transport outcomes to engine dispositions.
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn classify(outcome: SubmitOutcome) -> Disposition {
        match outcome {
            SubmitOutcome::Success(data) => Disposition::Commit(data),
            SubmitOutcome::Conflict { server_data } => Disposition::Resolve(server_data),
            SubmitOutcome::TransientFailure(reason) => Disposition::Retry(reason),
            SubmitOutcome::PermanentFailure(reason) => Disposition::Reject(reason),
        }
    }
}

/// Inputs to a conflict strategy.
#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    /// Record snapshot at enqueue time; `Null` if none was captured.
    pub base: &'a Value,
    /// The server's current record.
    pub server: &'a Value,
    /// The client's variables being replayed.
    pub client: &'a Value,
    pub operation_name: &'a str,
    pub id_field: &'a str,
    pub version_field: &'a str,
}

impl ConflictContext<'_> {
    /// Identity fields left out of field comparisons.
    pub fn identity_fields(&self) -> [&str; 2] {
        [self.id_field, self.version_field]
    }

    /// Field comparison of the three snapshots.
    pub fn analyze(&self) -> ConflictAnalysis {
        analyze(self.base, self.server, self.client, &self.identity_fields())
    }
}

/// Outcome of a conflict strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Record to resubmit.
    Merged(Value),
    /// The strategy declined; the entry fails.
    Unresolved(String),
}

/// Merges base, server, and client snapshots into the record to resubmit.
pub trait ConflictStrategy: Send + Sync {
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Resolution;
}

/// Per-field result of a three-way comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictAnalysis {
    /// Fields the client changed relative to the base.
    pub client_changed: BTreeSet<String>,
    /// Fields the server changed relative to the base.
    pub server_changed: BTreeSet<String>,
    /// Fields both sides changed, to different values.
    pub hard_conflicts: BTreeSet<String>,
}

impl ConflictAnalysis {
    /// True if every change can be kept without picking a side.
    pub fn is_mergeable(&self) -> bool {
        self.hard_conflicts.is_empty()
    }
}

/// Pseudo field name used when the snapshots are not JSON objects.
pub const ROOT_FIELD: &str = "$";

/// Compares client and server against the base, field by field.
///
/// A client field counts as changed when it is present in the variables and
/// differs from the base. A server field counts as changed when its value
/// (or absence) differs from the base. Without a base every client field is
/// changed, and the server is assumed to have changed whatever it disagrees
/// with the client on.
pub fn analyze(
    base: &Value,
    server: &Value,
    client: &Value,
    ignored_fields: &[&str],
) -> ConflictAnalysis {
    let mut analysis = ConflictAnalysis::default();

    let (Some(server_obj), Some(client_obj)) = (server.as_object(), client.as_object()) else {
        if server != client {
            analysis.client_changed.insert(ROOT_FIELD.to_string());
            analysis.server_changed.insert(ROOT_FIELD.to_string());
            analysis.hard_conflicts.insert(ROOT_FIELD.to_string());
        }
        return analysis;
    };
    let base_obj = base.as_object();
    let ignored = |field: &str| ignored_fields.contains(&field);

    for (field, value) in client_obj {
        if ignored(field) {
            continue;
        }
        let changed = match base_obj {
            Some(base) => base.get(field) != Some(value),
            None => true,
        };
        if changed {
            analysis.client_changed.insert(field.clone());
        }
    }

    match base_obj {
        Some(base) => {
            let fields: BTreeSet<&String> = server_obj.keys().chain(base.keys()).collect();
            for field in fields {
                if !ignored(field) && server_obj.get(field) != base.get(field) {
                    analysis.server_changed.insert(field.clone());
                }
            }
        }
        None => {
            for (field, value) in server_obj {
                if !ignored(field) && client_obj.get(field).is_some_and(|c| c != value) {
                    analysis.server_changed.insert(field.clone());
                }
            }
        }
    }

    for field in analysis.client_changed.intersection(&analysis.server_changed) {
        if client_obj.get(field) != server_obj.get(field) {
            analysis.hard_conflicts.insert(field.clone());
        }
    }
    analysis
}

/// Overlays the client's changed fields onto the server record.
fn overlay_client_changes(ctx: &ConflictContext<'_>, analysis: &ConflictAnalysis) -> Value {
    let (Some(server), Some(client)) = (ctx.server.as_object(), ctx.client.as_object()) else {
        return ctx.client.clone();
    };
    let mut merged: Map<String, Value> = server.clone();
    for field in &analysis.client_changed {
        if let Some(value) = client.get(field) {
            merged.insert(field.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Default strategy: every field the client changed wins outright, every
/// other field keeps the server's value, identity fields come from the
/// server.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWins;

impl ConflictStrategy for ClientWins {
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Resolution {
        let analysis = ctx.analyze();
        Resolution::Merged(overlay_client_changes(ctx, &analysis))
    }
}

/// Field-disjoint merge: keeps both sides' changes when they touch different
/// fields, declines when both changed the same field differently.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerge;

impl ConflictStrategy for FieldMerge {
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Resolution {
        let analysis = ctx.analyze();
        if !analysis.is_mergeable() {
            let fields: Vec<&str> = analysis.hard_conflicts.iter().map(String::as_str).collect();
            return Resolution::Unresolved(format!("conflicting fields: {}", fields.join(", ")));
        }
        Resolution::Merged(overlay_client_changes(ctx, &analysis))
    }
}

/// Strategy backed by a closure over `(base, server, client, operation_name)`.
pub struct FnStrategy<F>(F);

impl<F> FnStrategy<F>
where
    F: Fn(&Value, &Value, &Value, &str) -> Resolution + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ConflictStrategy for FnStrategy<F>
where
    F: Fn(&Value, &Value, &Value, &str) -> Resolution + Send + Sync,
{
    fn resolve(&self, ctx: &ConflictContext<'_>) -> Resolution {
        (self.0)(ctx.base, ctx.server, ctx.client, ctx.operation_name)
    }
}

/// Sets the merged record's version to the server's, so the resubmission
/// targets the record version the conflict reported.
pub fn with_server_version(merged: Value, server: &Value, version_field: &str) -> Value {
    match (merged, server.get(version_field)) {
        (Value::Object(mut obj), Some(version)) => {
            obj.insert(version_field.to_string(), version.clone());
            Value::Object(obj)
        }
        (merged, _) => merged,
    }
}
