use outbox_sync::cache::memory::MemoryCache;
use outbox_sync::{
    apply_insert, apply_remove, CacheReconciler, CacheUpdate, CacheUpdateError,
    CacheUpdateRegistry, QueryDescriptor, ReconcileReport, UpdateTarget,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn tasks() -> QueryDescriptor {
    QueryDescriptor::new("allTasks", "query { allTasks { id } }")
}

fn open_tasks() -> QueryDescriptor {
    QueryDescriptor::new("allTasks", "query($done: Boolean) { allTasks(done: $done) { id } }")
        .with_variables(json!({"done": false}))
}

fn make_reconciler(cache: &Arc<MemoryCache>) -> CacheReconciler {
    let registry = CacheUpdateRegistry::builder()
        .insert("createTask", [tasks(), open_tasks()], "id")
        .remove("deleteTask", [tasks(), open_tasks()], "id")
        .no_op("updateTask")
        .build()
        .unwrap();
    CacheReconciler::new(cache.clone(), Arc::new(registry))
}

// ── apply_insert ─────────────────────────────────────────────────

#[test]
fn insert_appends_new_record() {
    let current = json!({"allTasks": [{"id": "1"}]});
    let next = apply_insert(Some(current), "allTasks", "id", &json!({"id": "2"})).unwrap();
    assert_eq!(next, Some(json!({"allTasks": [{"id": "1"}, {"id": "2"}]})));
}

#[test]
fn insert_of_present_record_is_noop() {
    let current = json!({"allTasks": [{"id": "1", "title": "old"}]});
    let next = apply_insert(Some(current), "allTasks", "id", &json!({"id": "1", "title": "new"}));
    assert_eq!(next, Ok(None));
}

#[test]
fn insert_into_missing_result_creates_list() {
    let record = json!({"id": "1"});
    assert_eq!(
        apply_insert(None, "allTasks", "id", &record).unwrap(),
        Some(json!({"allTasks": [{"id": "1"}]}))
    );
    assert_eq!(
        apply_insert(Some(json!({"other": 1})), "allTasks", "id", &record).unwrap(),
        Some(json!({"other": 1, "allTasks": [{"id": "1"}]}))
    );
}

#[test]
fn insert_without_id_is_rejected() {
    let result = apply_insert(None, "allTasks", "id", &json!({"title": "x"}));
    assert_eq!(
        result,
        Err(CacheUpdateError::MissingId {
            id_field: "id".into()
        })
    );
}

#[test]
fn insert_into_non_list_is_malformed() {
    let result = apply_insert(Some(json!({"allTasks": 3})), "allTasks", "id", &json!({"id": "1"}));
    assert!(matches!(result, Err(CacheUpdateError::Malformed { .. })));
}

#[test]
fn insert_respects_custom_id_field() {
    let current = json!({"allTasks": [{"uuid": "a"}]});
    let next = apply_insert(Some(current), "allTasks", "uuid", &json!({"uuid": "a"}));
    assert_eq!(next, Ok(None));
}

// ── apply_remove ─────────────────────────────────────────────────

#[test]
fn remove_accepts_scalar_or_record() {
    let current = json!({"allTasks": [{"id": "1"}, {"id": "2"}, {"id": 3}]});

    let next = apply_remove(Some(current.clone()), "allTasks", "id", &json!("1")).unwrap();
    assert_eq!(next, Some(json!({"allTasks": [{"id": "2"}, {"id": 3}]})));

    let next = apply_remove(Some(current), "allTasks", "id", &json!({"id": 3})).unwrap();
    assert_eq!(next, Some(json!({"allTasks": [{"id": "1"}, {"id": "2"}]})));
}

#[test]
fn remove_of_absent_id_is_noop() {
    let current = json!({"allTasks": [{"id": "1"}]});
    assert_eq!(apply_remove(Some(current), "allTasks", "id", &json!("9")), Ok(None));
}

#[test]
fn remove_from_uncached_query_reports_not_cached() {
    assert_eq!(
        apply_remove(None, "allTasks", "id", &json!("1")),
        Err(CacheUpdateError::NotCached {
            field: "allTasks".into()
        })
    );
}

#[test]
fn remove_with_unusable_payload_is_rejected() {
    let current = json!({"allTasks": []});
    assert!(matches!(
        apply_remove(Some(current), "allTasks", "id", &json!(true)),
        Err(CacheUpdateError::MissingId { .. })
    ));
}

// ── CacheReconciler ──────────────────────────────────────────────

#[tokio::test]
async fn reconcile_insert_updates_every_target_query() {
    let cache = Arc::new(MemoryCache::new());
    let reconciler = make_reconciler(&cache);
    cache.put(&tasks(), json!({"allTasks": [{"id": "1"}]}));

    let report = reconciler.reconcile("createTask", &json!({"id": "2"})).await;

    assert!(report.is_clean());
    assert_eq!(report.written, 2);
    assert_eq!(cache.list(&tasks()).len(), 2);
    assert_eq!(cache.list(&open_tasks()), vec![json!({"id": "2"})]);
}

#[tokio::test]
async fn reconcile_twice_does_not_duplicate() {
    let cache = Arc::new(MemoryCache::new());
    let reconciler = make_reconciler(&cache);
    let record = json!({"id": "1"});

    reconciler.reconcile("createTask", &record).await;
    let second = reconciler.reconcile("createTask", &record).await;

    assert_eq!(second.written, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(cache.list(&tasks()).len(), 1);
}

#[tokio::test]
async fn reconcile_remove_collects_per_query_errors() {
    let cache = Arc::new(MemoryCache::new());
    let reconciler = make_reconciler(&cache);
    cache.put(&tasks(), json!({"allTasks": [{"id": "1"}]}));

    let report = reconciler.reconcile("deleteTask", &json!("1")).await;

    assert_eq!(report.written, 1);
    assert_eq!(
        report.errors,
        vec![CacheUpdateError::NotCached {
            field: "allTasks".into()
        }]
    );
    assert!(cache.list(&tasks()).is_empty());
}

#[tokio::test]
async fn reconcile_unregistered_and_no_op_do_nothing() {
    let cache = Arc::new(MemoryCache::new());
    let reconciler = make_reconciler(&cache);

    let unknown = reconciler.reconcile("archiveTask", &json!({"id": "1"})).await;
    let no_op = reconciler.reconcile("updateTask", &json!({"id": "1"})).await;

    assert_eq!(unknown, ReconcileReport::default());
    assert_eq!(no_op, ReconcileReport::default());
    assert_eq!(cache.write_count(), 0);
}

#[tokio::test]
async fn reconcile_reports_read_and_write_failures() {
    let cache = Arc::new(MemoryCache::new());
    let reconciler = make_reconciler(&cache);

    cache.set_fail_reads(true);
    let report = reconciler.reconcile("createTask", &json!({"id": "1"})).await;
    assert_eq!(report.errors.len(), 2);
    assert!(matches!(report.errors[0], CacheUpdateError::Read { .. }));

    cache.set_fail_reads(false);
    cache.set_fail_writes(true);
    let report = reconciler.reconcile("createTask", &json!({"id": "1"})).await;
    assert!(matches!(report.errors[0], CacheUpdateError::Write { .. }));
}

#[tokio::test]
async fn reconcile_with_explicit_update() {
    let cache = Arc::new(MemoryCache::new());
    let reconciler = CacheReconciler::new(cache.clone(), Arc::new(CacheUpdateRegistry::empty()));
    let update = CacheUpdate::Insert(UpdateTarget {
        queries: vec![tasks()],
        id_field: "key".into(),
    });

    let report = reconciler.reconcile_with(&update, &json!({"key": 9})).await;

    assert_eq!(report.written, 1);
    assert_eq!(cache.list(&tasks()), vec![json!({"key": 9})]);
}

// ── Properties ───────────────────────────────────────────────────

fn ids() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..8, 0..8)
}

fn list_of(ids: &[u8]) -> Value {
    json!({ "allTasks": ids.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>() })
}

fn apply_or_keep(current: Value, next: Option<Value>) -> Value {
    next.unwrap_or(current)
}

proptest! {
    #[test]
    fn insert_is_idempotent(existing in ids(), id in 0u8..8) {
        let record = json!({ "id": id });
        let once = apply_or_keep(
            list_of(&existing),
            apply_insert(Some(list_of(&existing)), "allTasks", "id", &record).unwrap(),
        );
        let twice = apply_insert(Some(once.clone()), "allTasks", "id", &record).unwrap();

        prop_assert_eq!(twice, None);
        let count = once["allTasks"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|r| r["id"] == json!(id))
            .count();
        prop_assert!(count >= 1);
    }

    #[test]
    fn remove_leaves_no_matching_record(existing in ids(), id in 0u8..8) {
        let once = apply_or_keep(
            list_of(&existing),
            apply_remove(Some(list_of(&existing)), "allTasks", "id", &json!(id)).unwrap(),
        );

        prop_assert!(once["allTasks"].as_array().unwrap().iter().all(|r| r["id"] != json!(id)));
        let twice = apply_remove(Some(once), "allTasks", "id", &json!(id)).unwrap();
        prop_assert_eq!(twice, None);
    }
}
