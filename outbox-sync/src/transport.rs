//! Transport boundary.
//!
//! The replay engine never talks to the network itself. It hands each queued
//! mutation to a [`MutationTransport`] and gets back an already classified
//! [`SubmitOutcome`].

use crate::context::ReplayContext;
use async_trait::async_trait;
use outbox_types::Operation;
use serde_json::Value;

/// Result of submitting one mutation to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The backend accepted the mutation and returned the resulting record.
    Success(Value),
    /// The target record's version no longer matches; carries the server's
    /// current record.
    Conflict { server_data: Value },
    /// The backend could not be reached. The mutation may be retried.
    TransientFailure(String),
    /// The backend rejected the mutation (validation, server error).
    PermanentFailure(String),
}

/// Sends mutations to the backend.
#[async_trait]
pub trait MutationTransport: Send + Sync {
    /// Submits a mutation and waits for the classified outcome.
    async fn submit(
        &self,
        operation: &Operation,
        variables: &Value,
        context: &ReplayContext,
    ) -> SubmitOutcome;
}

/// A mock backend for testing.
pub mod mock {
    use super::*;
    use outbox_types::EntryId;
    use serde_json::Map;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::{Mutex, MutexGuard};
    use std::time::Duration;

    /// How the mock backend treats a registered operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MockOp {
        /// Stores the variables as a new record at version 1.
        Create,
        /// Version-checked update of an existing record.
        Update,
        /// Deletes a record and returns its bare id.
        Delete,
    }

    /// A submission the mock backend received.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Submission {
        pub operation: String,
        pub variables: Value,
        pub offline_id: Option<EntryId>,
    }

    #[derive(Default)]
    struct State {
        online: bool,
        records: BTreeMap<String, Value>,
        operations: HashMap<String, MockOp>,
        rejections: HashMap<String, String>,
        scripted: VecDeque<SubmitOutcome>,
        submissions: Vec<Submission>,
        next_id: u64,
        delay: Option<Duration>,
    }

    /// An in-process backend holding versioned records.
    ///
    /// Updates carrying a version that differs from the stored one are
    /// answered with a conflict, like an optimistic-locking server would.
    pub struct MockBackend {
        state: Mutex<State>,
        id_field: String,
        version_field: String,
    }

    impl Default for MockBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockBackend {
        /// Creates an online backend using `id` and `version` fields.
        pub fn new() -> Self {
            Self {
                state: Mutex::new(State {
                    online: true,
                    next_id: 1,
                    ..State::default()
                }),
                id_field: "id".to_string(),
                version_field: "version".to_string(),
            }
        }

        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Registers how an operation is handled.
        #[must_use]
        pub fn with_operation(self, name: impl Into<String>, op: MockOp) -> Self {
            self.state().operations.insert(name.into(), op);
            self
        }

        /// Toggles reachability. Offline submissions fail transiently.
        pub fn set_online(&self, online: bool) {
            self.state().online = online;
        }

        /// Makes every submission of `operation` fail permanently.
        pub fn reject(&self, operation: impl Into<String>, reason: impl Into<String>) {
            self.state()
                .rejections
                .insert(operation.into(), reason.into());
        }

        /// Queues an outcome returned (once) for the next online submission.
        pub fn push_outcome(&self, outcome: SubmitOutcome) {
            self.state().scripted.push_back(outcome);
        }

        /// Delays every response, after the submission has been applied.
        pub fn set_delay(&self, delay: Duration) {
            self.state().delay = Some(delay);
        }

        /// Stores a record as-is.
        pub fn seed(&self, record: Value) {
            if let Some(key) = record.get(&self.id_field).and_then(key_of) {
                self.state().records.insert(key, record);
            }
        }

        /// Applies an edit the way another client would: fields overwrite
        /// the stored record and the version is bumped.
        pub fn remote_update(&self, id: &str, fields: Value) -> Option<Value> {
            let mut state = self.state();
            let existing = state.records.get(id)?.clone();
            let updated = self.overlay(&existing, &fields);
            state.records.insert(id.to_string(), updated.clone());
            Some(updated)
        }

        /// Returns the stored record with the given id.
        pub fn record(&self, id: &str) -> Option<Value> {
            self.state().records.get(id).cloned()
        }

        /// Returns every stored record, ordered by id.
        pub fn records(&self) -> Vec<Value> {
            self.state().records.values().cloned().collect()
        }

        /// Returns every submission received so far, in arrival order.
        pub fn submissions(&self) -> Vec<Submission> {
            self.state().submissions.clone()
        }

        fn overlay(&self, existing: &Value, fields: &Value) -> Value {
            let mut merged = existing.as_object().cloned().unwrap_or_default();
            if let Some(obj) = fields.as_object() {
                for (k, v) in obj {
                    if *k != self.version_field {
                        merged.insert(k.clone(), v.clone());
                    }
                }
            }
            let version = existing
                .get(&self.version_field)
                .and_then(Value::as_i64)
                .unwrap_or(0);
            merged.insert(self.version_field.clone(), Value::from(version + 1));
            Value::Object(merged)
        }

        fn handle(&self, operation: &Operation, variables: &Value) -> SubmitOutcome {
            let mut state = self.state();
            if !state.online {
                return SubmitOutcome::TransientFailure("backend unreachable".to_string());
            }
            if let Some(outcome) = state.scripted.pop_front() {
                return outcome;
            }
            if let Some(reason) = state.rejections.get(&operation.name) {
                return SubmitOutcome::PermanentFailure(reason.clone());
            }

            match state.operations.get(&operation.name).copied() {
                Some(MockOp::Create) => {
                    let mut record = variables.as_object().cloned().unwrap_or_else(Map::new);
                    let key = match record.get(&self.id_field).and_then(key_of) {
                        Some(key) => key,
                        None => {
                            let key = state.next_id.to_string();
                            state.next_id += 1;
                            record.insert(self.id_field.clone(), Value::String(key.clone()));
                            key
                        }
                    };
                    record.insert(self.version_field.clone(), Value::from(1));
                    let record = Value::Object(record);
                    state.records.insert(key, record.clone());
                    SubmitOutcome::Success(record)
                }
                Some(MockOp::Update) => {
                    let Some(key) = variables.get(&self.id_field).and_then(key_of) else {
                        return SubmitOutcome::PermanentFailure("missing id".to_string());
                    };
                    let Some(existing) = state.records.get(&key).cloned() else {
                        return SubmitOutcome::PermanentFailure(format!("record {key} not found"));
                    };
                    if let Some(version) = variables.get(&self.version_field) {
                        if existing.get(&self.version_field) != Some(version) {
                            return SubmitOutcome::Conflict {
                                server_data: existing,
                            };
                        }
                    }
                    let updated = self.overlay(&existing, variables);
                    state.records.insert(key, updated.clone());
                    SubmitOutcome::Success(updated)
                }
                Some(MockOp::Delete) => {
                    let key = match variables {
                        Value::Object(_) => variables.get(&self.id_field).and_then(key_of),
                        other => key_of(other),
                    };
                    let Some(key) = key else {
                        return SubmitOutcome::PermanentFailure("missing id".to_string());
                    };
                    if state.records.remove(&key).is_some() {
                        SubmitOutcome::Success(Value::String(key))
                    } else {
                        SubmitOutcome::PermanentFailure(format!("record {key} not found"))
                    }
                }
                None => SubmitOutcome::PermanentFailure(format!(
                    "unknown operation: {}",
                    operation.name
                )),
            }
        }
    }

    #[async_trait]
    impl MutationTransport for MockBackend {
        async fn submit(
            &self,
            operation: &Operation,
            variables: &Value,
            context: &ReplayContext,
        ) -> SubmitOutcome {
            let (outcome, delay) = {
                self.state().submissions.push(Submission {
                    operation: operation.name.clone(),
                    variables: variables.clone(),
                    offline_id: context.is_marked_offline().then_some(context.offline_id),
                });
                let outcome = self.handle(operation, variables);
                (outcome, self.state().delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
    }

    fn key_of(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
