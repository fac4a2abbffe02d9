//! Queue inspection and maintenance for the `outbox` binary.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use outbox_store::{QueueStore, SqliteQueueStore};
use outbox_types::{EntryId, EntryStatus, QueueEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One line of `outbox list`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EntrySummary {
    pub id: EntryId,
    pub operation: String,
    pub status: EntryStatus,
    pub attempts: u32,
    pub merged: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl From<&QueueEntry> for EntrySummary {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            id: entry.id,
            operation: entry.operation.name.clone(),
            status: entry.status,
            attempts: entry.attempts,
            merged: entry.merged,
            enqueued_at: entry.enqueued_at,
        }
    }
}

/// Output of `outbox stats`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct QueueStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

/// Queued entries in replay order.
pub fn list_entries(store: &SqliteQueueStore) -> Result<Vec<EntrySummary>> {
    let entries = store.drain_ordered().context("Failed to read queue")?;
    Ok(entries.iter().map(EntrySummary::from).collect())
}

/// Looks up one entry by id.
pub fn show_entry(store: &SqliteQueueStore, id: &str) -> Result<QueueEntry> {
    let id = EntryId::parse(id).with_context(|| format!("Invalid entry id: {id}"))?;
    match store.get(&id).context("Failed to read queue")? {
        Some(entry) => Ok(entry),
        None => bail!("No queued entry {id}"),
    }
}

/// Removes one entry without replaying it.
pub fn drop_entry(store: &SqliteQueueStore, id: &str) -> Result<EntryId> {
    let id = EntryId::parse(id).with_context(|| format!("Invalid entry id: {id}"))?;
    if !store.remove(&id).context("Failed to update queue")? {
        bail!("No queued entry {id}");
    }
    Ok(id)
}

/// Resets entries stuck `in-flight` to `pending`.
pub fn requeue(store: &SqliteQueueStore) -> Result<usize> {
    store
        .recover_in_flight()
        .context("Failed to reset in-flight entries")
}

/// Counts entries by status.
pub fn stats(store: &SqliteQueueStore) -> Result<QueueStats> {
    let counts = store.count_by_status().context("Failed to read queue")?;
    let mut stats = QueueStats::default();
    for (status, count) in counts {
        stats.total += count;
        stats.by_status.insert(status.to_string(), count);
    }
    Ok(stats)
}

/// Renders `outbox list` output as text.
pub fn render_list(entries: &[EntrySummary]) -> String {
    if entries.is_empty() {
        return "Queue is empty\n".to_string();
    }
    let mut out = String::new();
    for e in entries {
        let _ = writeln!(
            out,
            "{}  {:<9}  {:<24}  attempts={}{}  {}",
            e.id,
            e.status.as_str(),
            e.operation,
            e.attempts,
            if e.merged { " merged" } else { "" },
            e.enqueued_at.to_rfc3339(),
        );
    }
    out
}

/// Renders `outbox stats` output as text.
pub fn render_stats(stats: &QueueStats) -> String {
    let mut out = format!("total: {}\n", stats.total);
    for (status, count) in &stats.by_status {
        let _ = writeln!(out, "{status}: {count}");
    }
    out
}
