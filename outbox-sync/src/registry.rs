//! Cache update registry.
//!
//! Binds operation names to the way their results are folded into cached
//! queries. Built and validated once at configuration time, read-only after.

use crate::cache::QueryDescriptor;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The kind of cache update an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheOperation {
    /// Append the result record to each target query.
    Insert,
    /// Remove the result record (or id) from each target query.
    Remove,
    /// In-place field update; the normalized cache handles it.
    NoOp,
}

/// Queries to rewrite and the field that identifies records within them.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateTarget {
    pub queries: Vec<QueryDescriptor>,
    pub id_field: String,
}

/// A validated cache update for one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    Insert(UpdateTarget),
    Remove(UpdateTarget),
    NoOp,
}

impl CacheUpdate {
    /// Returns the operation kind.
    pub fn operation(&self) -> CacheOperation {
        match self {
            Self::Insert(_) => CacheOperation::Insert,
            Self::Remove(_) => CacheOperation::Remove,
            Self::NoOp => CacheOperation::NoOp,
        }
    }

    /// Returns the id field, if the update rewrites queries.
    pub fn id_field(&self) -> Option<&str> {
        match self {
            Self::Insert(t) | Self::Remove(t) => Some(&t.id_field),
            Self::NoOp => None,
        }
    }
}

fn default_id_field() -> String {
    "id".to_string()
}

/// Unvalidated cache update configuration, as written by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheUpdateSpec {
    pub operation: CacheOperation,
    #[serde(default)]
    pub queries: Vec<QueryDescriptor>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

impl CacheUpdateSpec {
    fn validate(self, operation_name: &str) -> SyncResult<CacheUpdate> {
        if operation_name.trim().is_empty() {
            return Err(SyncError::Config("operation name must not be empty".into()));
        }
        if self.operation == CacheOperation::NoOp {
            return Ok(CacheUpdate::NoOp);
        }
        if self.id_field.trim().is_empty() {
            return Err(SyncError::Config(format!(
                "{operation_name}: id field must not be empty"
            )));
        }
        if self.queries.is_empty() {
            return Err(SyncError::Config(format!(
                "{operation_name}: {:?} update needs at least one target query",
                self.operation
            )));
        }
        if let Some(q) = self.queries.iter().find(|q| q.result_field.trim().is_empty()) {
            return Err(SyncError::Config(format!(
                "{operation_name}: query {:?} has an empty result field",
                q.document
            )));
        }

        let target = UpdateTarget {
            queries: self.queries,
            id_field: self.id_field,
        };
        Ok(match self.operation {
            CacheOperation::Insert => CacheUpdate::Insert(target),
            CacheOperation::Remove => CacheUpdate::Remove(target),
            CacheOperation::NoOp => CacheUpdate::NoOp,
        })
    }
}

/// Operation name to cache update mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheUpdateRegistry {
    updates: HashMap<String, CacheUpdate>,
}

impl CacheUpdateRegistry {
    /// A registry with no updates; every operation is a cache no-op.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Starts building a registry.
    pub fn builder() -> CacheUpdateRegistryBuilder {
        CacheUpdateRegistryBuilder::default()
    }

    /// Parses a JSON object of `operationName -> CacheUpdateSpec`.
    ///
    /// ```
    /// use outbox_sync::CacheUpdateRegistry;
    ///
    /// let registry = CacheUpdateRegistry::from_json(r#"{
    ///     "createTask": {
    ///         "operation": "insert",
    ///         "queries": [{ "result_field": "allTasks" }]
    ///     },
    ///     "updateTask": { "operation": "no-op" }
    /// }"#).unwrap();
    /// assert_eq!(registry.len(), 2);
    /// ```
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let specs: BTreeMap<String, CacheUpdateSpec> = serde_json::from_str(json)?;
        specs
            .into_iter()
            .fold(Self::builder(), |b, (name, spec)| b.spec(name, spec))
            .build()
    }

    /// Looks up the update registered for an operation.
    pub fn get(&self, operation_name: &str) -> Option<&CacheUpdate> {
        self.updates.get(operation_name)
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Registered operation names, sorted.
    pub fn operation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.updates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Collects specs and validates them all in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct CacheUpdateRegistryBuilder {
    specs: Vec<(String, CacheUpdateSpec)>,
}

impl CacheUpdateRegistryBuilder {
    /// Adds an unvalidated update.
    #[must_use]
    pub fn spec(mut self, operation_name: impl Into<String>, spec: CacheUpdateSpec) -> Self {
        self.specs.push((operation_name.into(), spec));
        self
    }

    /// Registers an insert update.
    #[must_use]
    pub fn insert(
        self,
        operation_name: impl Into<String>,
        queries: impl IntoIterator<Item = QueryDescriptor>,
        id_field: impl Into<String>,
    ) -> Self {
        self.spec(
            operation_name,
            CacheUpdateSpec {
                operation: CacheOperation::Insert,
                queries: queries.into_iter().collect(),
                id_field: id_field.into(),
            },
        )
    }

    /// Registers a remove update.
    #[must_use]
    pub fn remove(
        self,
        operation_name: impl Into<String>,
        queries: impl IntoIterator<Item = QueryDescriptor>,
        id_field: impl Into<String>,
    ) -> Self {
        self.spec(
            operation_name,
            CacheUpdateSpec {
                operation: CacheOperation::Remove,
                queries: queries.into_iter().collect(),
                id_field: id_field.into(),
            },
        )
    }

    /// Registers an operation whose result needs no query rewrite.
    #[must_use]
    pub fn no_op(self, operation_name: impl Into<String>) -> Self {
        self.spec(
            operation_name,
            CacheUpdateSpec {
                operation: CacheOperation::NoOp,
                queries: Vec::new(),
                id_field: default_id_field(),
            },
        )
    }

    /// Validates every update. Fails on the first malformed or duplicate one.
    pub fn build(self) -> SyncResult<CacheUpdateRegistry> {
        let mut updates = HashMap::with_capacity(self.specs.len());
        for (name, spec) in self.specs {
            let update = spec.validate(&name)?;
            if updates.insert(name.clone(), update).is_some() {
                return Err(SyncError::Config(format!(
                    "duplicate cache update for operation {name}"
                )));
            }
        }
        Ok(CacheUpdateRegistry { updates })
    }
}
