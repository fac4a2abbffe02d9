use outbox_sync::transport::mock::{MockBackend, MockOp};
use outbox_sync::{replay_context, MutationTransport, ReplayContext, SubmitOutcome};
use outbox_types::{EntryId, NewEntry, Operation, QueueEntry};
use serde_json::{json, Value};

fn make_backend() -> MockBackend {
    MockBackend::new()
        .with_operation("createTask", MockOp::Create)
        .with_operation("updateTask", MockOp::Update)
        .with_operation("deleteTask", MockOp::Delete)
}

fn offline_context(name: &str, variables: &Value) -> ReplayContext {
    let entry = QueueEntry::from_new(
        EntryId::new(),
        NewEntry::new(Operation::named(name), variables.clone()),
    );
    replay_context(&entry)
}

async fn submit(backend: &MockBackend, name: &str, variables: Value) -> SubmitOutcome {
    let context = offline_context(name, &variables);
    backend
        .submit(&Operation::named(name), &variables, &context)
        .await
}

// ── Records ──────────────────────────────────────────────────────

#[tokio::test]
async fn create_assigns_id_and_version() {
    let backend = make_backend();

    let first = submit(&backend, "createTask", json!({"title": "a"})).await;
    let second = submit(&backend, "createTask", json!({"title": "b"})).await;

    assert_eq!(
        first,
        SubmitOutcome::Success(json!({"id": "1", "title": "a", "version": 1}))
    );
    assert!(matches!(second, SubmitOutcome::Success(ref r) if r["id"] == "2"));
    assert_eq!(backend.records().len(), 2);
}

#[tokio::test]
async fn update_with_current_version_bumps_it() {
    let backend = make_backend();
    backend.seed(json!({"id": "1", "title": "a", "version": 1}));

    let outcome = submit(&backend, "updateTask", json!({"id": "1", "title": "b", "version": 1})).await;

    assert_eq!(
        outcome,
        SubmitOutcome::Success(json!({"id": "1", "title": "b", "version": 2}))
    );
}

#[tokio::test]
async fn update_with_stale_version_conflicts() {
    let backend = make_backend();
    backend.seed(json!({"id": "1", "title": "a", "version": 1}));
    backend.remote_update("1", json!({"title": "remote"}));

    let outcome = submit(&backend, "updateTask", json!({"id": "1", "title": "b", "version": 1})).await;

    assert_eq!(
        outcome,
        SubmitOutcome::Conflict {
            server_data: json!({"id": "1", "title": "remote", "version": 2})
        }
    );
    assert_eq!(backend.record("1").unwrap()["title"], "remote");
}

#[tokio::test]
async fn delete_returns_bare_id() {
    let backend = make_backend();
    backend.seed(json!({"id": "5", "version": 1}));

    let outcome = submit(&backend, "deleteTask", json!("5")).await;
    assert_eq!(outcome, SubmitOutcome::Success(json!("5")));

    let again = submit(&backend, "deleteTask", json!({"id": "5"})).await;
    assert!(matches!(again, SubmitOutcome::PermanentFailure(_)));
}

// ── Failure injection ────────────────────────────────────────────

#[tokio::test]
async fn offline_backend_fails_transiently() {
    let backend = make_backend();
    backend.set_online(false);

    let outcome = submit(&backend, "createTask", json!({})).await;

    assert!(matches!(outcome, SubmitOutcome::TransientFailure(_)));
    assert!(backend.records().is_empty());
}

#[tokio::test]
async fn rejected_and_unknown_operations_fail_permanently() {
    let backend = make_backend();
    backend.reject("createTask", "title required");

    assert_eq!(
        submit(&backend, "createTask", json!({})).await,
        SubmitOutcome::PermanentFailure("title required".into())
    );
    assert!(matches!(
        submit(&backend, "archiveTask", json!({})).await,
        SubmitOutcome::PermanentFailure(reason) if reason.contains("archiveTask")
    ));
}

#[tokio::test]
async fn scripted_outcomes_come_first_and_once() {
    let backend = make_backend();
    backend.push_outcome(SubmitOutcome::TransientFailure("blip".into()));

    let first = submit(&backend, "createTask", json!({})).await;
    let second = submit(&backend, "createTask", json!({})).await;

    assert_eq!(first, SubmitOutcome::TransientFailure("blip".into()));
    assert!(matches!(second, SubmitOutcome::Success(_)));
}

#[tokio::test]
async fn submissions_are_recorded_with_offline_id() {
    let backend = make_backend();
    let variables = json!({"title": "a"});
    let context = offline_context("createTask", &variables);

    backend
        .submit(&Operation::named("createTask"), &variables, &context)
        .await;

    let submissions = backend.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].operation, "createTask");
    assert_eq!(submissions[0].offline_id, Some(context.offline_id));
}
