//! SQLite-backed queue store.
//!
//! One table, `offline_queue`, keyed by an `AUTOINCREMENT` sequence so that
//! replay order is insertion order and sequence numbers are never reused,
//! even after the newest entry has been removed. Rows that fail to decode
//! are moved to `offline_queue_dead_letter` by
//! [`QueueStore::quarantine_undecodable`].

use crate::error::{StoreError, StoreResult};
use crate::{QueueStore, UndecodableEntry};
use chrono::{DateTime, Utc};
use outbox_types::{EntryId, EntryPatch, EntryStatus, NewEntry, QueueEntry};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

const SELECT_COLUMNS: &str = "id, operation_name, document, variables, optimistic_response, \
     conflict_base, return_type, status, attempts, merged, enqueued_at, seq";

/// Persistent queue store backed by SQLite.
#[derive(Clone)]
pub struct SqliteQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueueStore {
    /// Opens (or creates) a queue store at the given path.
    ///
    /// The database runs in WAL mode with `synchronous = FULL`, so an
    /// enqueue that returned is on disk.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory queue store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS offline_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                operation_name TEXT NOT NULL,
                document TEXT NOT NULL,
                variables TEXT NOT NULL,
                optimistic_response TEXT,
                conflict_base TEXT,
                return_type TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                merged INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_offline_queue_status ON offline_queue(status);

            CREATE TABLE IF NOT EXISTS offline_queue_dead_letter (
                seq INTEGER PRIMARY KEY,
                id TEXT NOT NULL,
                operation_name TEXT NOT NULL,
                document TEXT NOT NULL,
                variables TEXT NOT NULL,
                optimistic_response TEXT,
                conflict_base TEXT,
                return_type TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                merged INTEGER NOT NULL,
                enqueued_at TEXT NOT NULL,
                reason TEXT NOT NULL,
                quarantined_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Counts stored entries grouped by status.
    pub fn count_by_status(&self) -> StoreResult<Vec<(EntryStatus, usize)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM offline_queue GROUP BY status ORDER BY status",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((status, count))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = Vec::with_capacity(rows.len());
        for (status, count) in rows {
            let status: EntryStatus = status
                .parse()
                .map_err(|e| StoreError::InvalidData(format!("{e}")))?;
            result.push((status, count as usize));
        }
        Ok(result)
    }

    /// Number of rows moved to the dead-letter table.
    pub fn dead_letter_len(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM offline_queue_dead_letter",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn load_raw(&self) -> StoreResult<Vec<RawEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM offline_queue ORDER BY seq ASC"
        ))?;
        let raws = stmt
            .query_map([], RawEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(raws)
    }
}

impl QueueStore for SqliteQueueStore {
    fn enqueue(&self, new: NewEntry) -> StoreResult<EntryId> {
        let entry = QueueEntry::from_new(EntryId::new(), new);
        let variables = serde_json::to_string(&entry.variables)?;
        let optimistic = entry
            .optimistic_response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let base = entry
            .conflict_base
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO offline_queue (id, operation_name, document, variables, optimistic_response, \
             conflict_base, return_type, status, attempts, merged, enqueued_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id.to_string(),
                entry.operation.name,
                entry.operation.document,
                variables,
                optimistic,
                base,
                entry.return_type,
                entry.status.as_str(),
                i64::from(entry.attempts),
                entry.merged,
                entry.enqueued_at.to_rfc3339(),
            ],
        )?;
        debug!("Enqueued {} ({})", entry.id, entry.operation.name);
        Ok(entry.id)
    }

    fn drain_ordered(&self) -> StoreResult<Vec<QueueEntry>> {
        let raws = self.load_raw()?;
        let mut entries = Vec::with_capacity(raws.len());
        for raw in raws {
            let (seq, id) = (raw.seq, raw.id.clone());
            match raw.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping undecodable queue row {} ({}): {}", seq, id, e),
            }
        }
        Ok(entries)
    }

    fn get(&self, id: &EntryId) -> StoreResult<Option<QueueEntry>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM offline_queue WHERE id = ?1"),
                params![id.to_string()],
                RawEntry::from_row,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    fn update(&self, id: &EntryId, patch: &EntryPatch) -> StoreResult<()> {
        let variables = patch
            .variables
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE offline_queue SET \
             status = COALESCE(?2, status), \
             variables = COALESCE(?3, variables), \
             attempts = COALESCE(?4, attempts), \
             merged = COALESCE(?5, merged) \
             WHERE id = ?1",
            params![
                id.to_string(),
                patch.status.map(|s| s.as_str()),
                variables,
                patch.attempts.map(i64::from),
                patch.merged,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn remove(&self, id: &EntryId) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM offline_queue WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn len(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn recover_in_flight(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE offline_queue SET status = ?1 WHERE status = ?2",
            params![EntryStatus::Pending.as_str(), EntryStatus::InFlight.as_str()],
        )?;
        Ok(changed)
    }

    fn quarantine_undecodable(&self) -> StoreResult<Vec<UndecodableEntry>> {
        let mut bad = Vec::new();
        for raw in self.load_raw()? {
            let (seq, id, operation_name) =
                (raw.seq, raw.id.clone(), raw.operation_name.clone());
            if let Err(e) = raw.into_entry() {
                let reason = e.to_string();
                bad.push((
                    seq,
                    UndecodableEntry {
                        id,
                        operation_name,
                        reason,
                    },
                ));
            }
        }
        if bad.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (seq, entry) in &bad {
            tx.execute(
                "INSERT OR REPLACE INTO offline_queue_dead_letter \
                 SELECT seq, id, operation_name, document, variables, optimistic_response, \
                 conflict_base, return_type, status, attempts, merged, enqueued_at, ?2, ?3 \
                 FROM offline_queue WHERE seq = ?1",
                params![seq, entry.reason, now],
            )?;
            tx.execute("DELETE FROM offline_queue WHERE seq = ?1", params![seq])?;
        }
        tx.commit()?;

        for (seq, entry) in &bad {
            warn!("Quarantined queue row {} ({}): {}", seq, entry.id, entry.reason);
        }
        Ok(bad.into_iter().map(|(_, entry)| entry).collect())
    }
}

/// A row as stored, before JSON and id decoding.
struct RawEntry {
    id: String,
    operation_name: String,
    document: String,
    variables: String,
    optimistic_response: Option<String>,
    conflict_base: Option<String>,
    return_type: Option<String>,
    status: String,
    attempts: i64,
    merged: bool,
    enqueued_at: String,
    seq: i64,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            operation_name: row.get(1)?,
            document: row.get(2)?,
            variables: row.get(3)?,
            optimistic_response: row.get(4)?,
            conflict_base: row.get(5)?,
            return_type: row.get(6)?,
            status: row.get(7)?,
            attempts: row.get(8)?,
            merged: row.get(9)?,
            enqueued_at: row.get(10)?,
            seq: row.get(11)?,
        })
    }

    fn into_entry(self) -> StoreResult<QueueEntry> {
        let id = EntryId::parse(&self.id)
            .map_err(|e| StoreError::InvalidData(format!("invalid entry id {}: {e}", self.id)))?;
        let status: EntryStatus = self
            .status
            .parse()
            .map_err(|e| StoreError::InvalidData(format!("{e}")))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| StoreError::InvalidData(format!("invalid attempts: {}", self.attempts)))?;
        let enqueued_at = DateTime::parse_from_rfc3339(&self.enqueued_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::InvalidData(format!("invalid enqueued_at: {e}")))?;

        Ok(QueueEntry {
            id,
            operation: outbox_types::Operation::new(self.operation_name, self.document),
            variables: serde_json::from_str(&self.variables)?,
            optimistic_response: self
                .optimistic_response
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            conflict_base: self
                .conflict_base
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            return_type: self.return_type,
            status,
            attempts,
            merged: self.merged,
            enqueued_at,
        })
    }
}
