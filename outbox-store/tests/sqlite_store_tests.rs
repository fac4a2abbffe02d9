use outbox_store::{QueueStore, SqliteQueueStore, StoreError};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use outbox_types::{EntryId, EntryPatch, EntryStatus, NewEntry, Operation};
use serde_json::json;
use std::sync::Arc;
use std::thread;

fn new_entry(name: &str, n: i64) -> NewEntry {
    NewEntry::new(Operation::named(name), json!({"n": n}))
}

#[test]
fn enqueue_and_get() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let new = NewEntry::new(
        Operation::new("updateTask", "mutation { updateTask }"),
        json!({"id": "1", "title": "offline"}),
    )
    .with_conflict_base(json!({"id": "1", "title": "online", "version": 3}))
    .with_return_type("Task")
    .with_optimistic_response(json!({"__typename": "Task", "id": "1"}));

    let id = store.enqueue(new).unwrap();
    let entry = store.get(&id).unwrap().unwrap();

    assert_eq!(entry.id, id);
    assert_eq!(entry.operation.name, "updateTask");
    assert_eq!(entry.operation.document, "mutation { updateTask }");
    assert_eq!(entry.variables["title"], "offline");
    assert_eq!(entry.conflict_base.as_ref().unwrap()["version"], 3);
    assert_eq!(entry.return_type.as_deref(), Some("Task"));
    assert_eq!(entry.optimistic_response.as_ref().unwrap()["__typename"], "Task");
    assert_eq!(entry.status, EntryStatus::Pending);
    assert_eq!(entry.attempts, 0);
    assert!(!entry.merged);
}

#[test]
fn get_missing_returns_none() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    assert!(store.get(&EntryId::new()).unwrap().is_none());
}

#[test]
fn drain_returns_insertion_order() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let ids: Vec<_> = (0..5)
        .map(|n| store.enqueue(new_entry("op", n)).unwrap())
        .collect();

    let drained: Vec<_> = store.drain_ordered().unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(drained, ids);
}

#[test]
fn drain_is_a_snapshot() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    store.enqueue(new_entry("a", 1)).unwrap();
    let snapshot = store.drain_ordered().unwrap();

    let late = store.enqueue(new_entry("b", 2)).unwrap();
    assert_eq!(snapshot.len(), 1);

    let next = store.drain_ordered().unwrap();
    assert_eq!(next.len(), 2);
    assert_eq!(next[1].id, late);
}

#[test]
fn order_survives_removal_of_newest() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let first = store.enqueue(new_entry("a", 1)).unwrap();
    let second = store.enqueue(new_entry("b", 2)).unwrap();
    store.remove(&second).unwrap();
    let third = store.enqueue(new_entry("c", 3)).unwrap();

    let drained: Vec<_> = store.drain_ordered().unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(drained, vec![first, third]);
}

#[test]
fn update_patches_fields() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let id = store.enqueue(new_entry("op", 1)).unwrap();

    store
        .update(
            &id,
            &EntryPatch {
                status: Some(EntryStatus::InFlight),
                attempts: Some(2),
                ..EntryPatch::default()
            },
        )
        .unwrap();
    let entry = store.get(&id).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::InFlight);
    assert_eq!(entry.attempts, 2);
    assert_eq!(entry.variables, json!({"n": 1}));

    store
        .update(
            &id,
            &EntryPatch {
                variables: Some(json!({"n": 99})),
                merged: Some(true),
                ..EntryPatch::default()
            },
        )
        .unwrap();
    let entry = store.get(&id).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::InFlight);
    assert_eq!(entry.variables, json!({"n": 99}));
    assert!(entry.merged);
}

#[test]
fn update_missing_is_not_found() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let err = store
        .update(&EntryId::new(), &EntryPatch::status(EntryStatus::Failed))
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[test]
fn remove_is_idempotent() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let id = store.enqueue(new_entry("op", 1)).unwrap();
    assert!(store.remove(&id).unwrap());
    assert!(!store.remove(&id).unwrap());
    assert!(store.is_empty().unwrap());
}

#[test]
fn recover_in_flight_resets_to_pending() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let a = store.enqueue(new_entry("a", 1)).unwrap();
    let b = store.enqueue(new_entry("b", 2)).unwrap();
    store.update(&a, &EntryPatch::status(EntryStatus::InFlight)).unwrap();

    assert_eq!(store.recover_in_flight().unwrap(), 1);
    assert_eq!(store.get(&a).unwrap().unwrap().status, EntryStatus::Pending);
    assert_eq!(store.get(&b).unwrap().unwrap().status, EntryStatus::Pending);
    assert_eq!(store.recover_in_flight().unwrap(), 0);
}

#[test]
fn count_by_status_groups() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    let a = store.enqueue(new_entry("a", 1)).unwrap();
    store.enqueue(new_entry("b", 2)).unwrap();
    store.enqueue(new_entry("c", 3)).unwrap();
    store.update(&a, &EntryPatch::status(EntryStatus::InFlight)).unwrap();

    let counts = store.count_by_status().unwrap();
    assert!(counts.contains(&(EntryStatus::InFlight, 1)));
    assert!(counts.contains(&(EntryStatus::Pending, 2)));
}

// ── Durability ───────────────────────────────────────────────────

#[test]
fn entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let ids: Vec<_> = {
        let store = SqliteQueueStore::open(&path).unwrap();
        (0..3)
            .map(|n| store.enqueue(new_entry("createTask", n)).unwrap())
            .collect()
    };

    let store = SqliteQueueStore::open(&path).unwrap();
    let drained = store.drain_ordered().unwrap();
    assert_eq!(drained.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
    assert_eq!(drained[2].variables, json!({"n": 2}));
}

#[test]
fn ids_round_trip_through_text_column_and_stay_unique_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let before = {
        let store = SqliteQueueStore::open(&path).unwrap();
        store.enqueue(new_entry("op", 1)).unwrap()
    };

    let raw: String = Connection::open(&path)
        .unwrap()
        .query_row("SELECT id FROM offline_queue", [], |row| row.get(0))
        .unwrap();
    assert_eq!(raw, before.to_string());

    let store = SqliteQueueStore::open(&path).unwrap();
    let after = store.enqueue(new_entry("op", 2)).unwrap();
    let ids: HashSet<EntryId> = store.drain_ordered().unwrap().iter().map(|e| e.id).collect();
    assert_eq!(ids, HashSet::from([before, after]));
}

#[test]
fn in_flight_status_persists_until_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let id = {
        let store = SqliteQueueStore::open(&path).unwrap();
        let id = store.enqueue(new_entry("op", 1)).unwrap();
        store.update(&id, &EntryPatch::status(EntryStatus::InFlight)).unwrap();
        id
    };

    let store = SqliteQueueStore::open(&path).unwrap();
    assert_eq!(store.get(&id).unwrap().unwrap().status, EntryStatus::InFlight);
    assert_eq!(store.recover_in_flight().unwrap(), 1);
}

#[test]
fn concurrent_enqueues_are_all_kept() {
    let store = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                for n in 0..25 {
                    store.enqueue(new_entry("op", t * 100 + n)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let drained = store.drain_ordered().unwrap();
    assert_eq!(drained.len(), 100);

    // Per-thread order is preserved within the global order.
    for t in 0..4 {
        let seen: Vec<i64> = drained
            .iter()
            .map(|e| e.variables["n"].as_i64().unwrap())
            .filter(|n| n / 100 == t)
            .collect();
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }
}

// ── Undecodable rows ─────────────────────────────────────────────

fn corrupt(path: &std::path::Path, id: &EntryId, column: &str, value: &str) {
    let conn = Connection::open(path).unwrap();
    let changed = conn
        .execute(
            &format!("UPDATE offline_queue SET {column} = ?1 WHERE id = ?2"),
            params![value, id.to_string()],
        )
        .unwrap();
    assert_eq!(changed, 1);
}

#[test]
fn drain_skips_rows_that_do_not_decode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let store = SqliteQueueStore::open(&path).unwrap();
    let bad = store.enqueue(new_entry("a", 1)).unwrap();
    let good = store.enqueue(new_entry("b", 2)).unwrap();

    corrupt(&path, &bad, "variables", "{not json");

    let drained: Vec<_> = store.drain_ordered().unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(drained, vec![good]);
}

#[test]
fn quarantine_moves_undecodable_rows_to_dead_letter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let store = SqliteQueueStore::open(&path).unwrap();
    let bad_json = store.enqueue(new_entry("a", 1)).unwrap();
    let good = store.enqueue(new_entry("b", 2)).unwrap();
    let bad_status = store.enqueue(new_entry("c", 3)).unwrap();
    let bad_id = store.enqueue(new_entry("d", 4)).unwrap();

    corrupt(&path, &bad_json, "variables", "{not json");
    corrupt(&path, &bad_status, "status", "paused");
    corrupt(&path, &bad_id, "id", "not-a-uuid");

    let quarantined = store.quarantine_undecodable().unwrap();
    assert_eq!(quarantined.len(), 3);
    assert_eq!(quarantined[0].entry_id(), Some(bad_json));
    assert_eq!(quarantined[0].operation_name, "a");
    assert!(quarantined[0].reason.contains("serialization"));
    assert_eq!(quarantined[1].entry_id(), Some(bad_status));
    assert!(quarantined[1].reason.contains("paused"));
    assert_eq!(quarantined[2].id, "not-a-uuid");
    assert_eq!(quarantined[2].entry_id(), None);

    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.get(&good).unwrap().unwrap().operation.name, "b");
    assert_eq!(store.dead_letter_len().unwrap(), 3);
    assert!(store.quarantine_undecodable().unwrap().is_empty());
}

#[test]
fn quarantine_of_clean_queue_changes_nothing() {
    let store = SqliteQueueStore::open_in_memory().unwrap();
    store.enqueue(new_entry("a", 1)).unwrap();

    assert!(store.quarantine_undecodable().unwrap().is_empty());
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.dead_letter_len().unwrap(), 0);
}
