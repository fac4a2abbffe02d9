//! Cache reconciliation.
//!
//! Folds a committed mutation's result into the cached queries its operation
//! is registered against. Failures here never change the mutation's own
//! outcome; they are collected into a [`ReconcileReport`] for logging.
//!
//! The list rewrites are pure functions ([`apply_insert`], [`apply_remove`])
//! and are idempotent: a `None` return means the cache already reflects the
//! change and no write is needed.

use crate::cache::{QueryDescriptor, ReadCache};
use crate::registry::{CacheOperation, CacheUpdate, CacheUpdateRegistry};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// A non-fatal failure to update one cached query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheUpdateError {
    #[error("query {field} is not cached")]
    NotCached { field: String },

    #[error("reading {field} failed: {detail}")]
    Read { field: String, detail: String },

    #[error("writing {field} failed: {detail}")]
    Write { field: String, detail: String },

    #[error("cached {field} is not a list of records")]
    Malformed { field: String },

    #[error("mutation result has no usable {id_field}")]
    MissingId { id_field: String },
}

/// What happened while reconciling one mutation result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Queries rewritten in the cache.
    pub written: usize,
    /// Queries already up to date.
    pub unchanged: usize,
    /// Queries that could not be updated.
    pub errors: Vec<CacheUpdateError>,
}

impl ReconcileReport {
    /// True when no target query failed.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Applies registered cache updates against the host's read cache.
pub struct CacheReconciler {
    cache: Arc<dyn ReadCache>,
    registry: Arc<CacheUpdateRegistry>,
}

impl CacheReconciler {
    pub fn new(cache: Arc<dyn ReadCache>, registry: Arc<CacheUpdateRegistry>) -> Self {
        Self { cache, registry }
    }

    pub fn registry(&self) -> &CacheUpdateRegistry {
        &self.registry
    }

    /// Reconciles the result of `operation_name`. Operations without a
    /// registered update are a no-op.
    pub async fn reconcile(&self, operation_name: &str, result: &Value) -> ReconcileReport {
        match self.registry.get(operation_name) {
            Some(update) => self.reconcile_with(update, result).await,
            None => {
                debug!("No cache update registered for {}", operation_name);
                ReconcileReport::default()
            }
        }
    }

    /// Applies one update to each of its target queries independently.
    pub async fn reconcile_with(&self, update: &CacheUpdate, result: &Value) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let (kind, target) = match update {
            CacheUpdate::Insert(t) => (CacheOperation::Insert, t),
            CacheUpdate::Remove(t) => (CacheOperation::Remove, t),
            CacheUpdate::NoOp => return report,
        };

        for query in &target.queries {
            match self.apply(kind, query, &target.id_field, result).await {
                Ok(true) => report.written += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => report.errors.push(e),
            }
        }
        report
    }

    async fn apply(
        &self,
        kind: CacheOperation,
        query: &QueryDescriptor,
        id_field: &str,
        result: &Value,
    ) -> Result<bool, CacheUpdateError> {
        let field = &query.result_field;
        let current = self
            .cache
            .read(query)
            .await
            .map_err(|e| CacheUpdateError::Read {
                field: field.clone(),
                detail: e.to_string(),
            })?;

        let next = match kind {
            CacheOperation::Insert => apply_insert(current, field, id_field, result)?,
            CacheOperation::Remove => apply_remove(current, field, id_field, result)?,
            CacheOperation::NoOp => None,
        };

        let Some(next) = next else {
            return Ok(false);
        };
        self.cache
            .write(query, next)
            .await
            .map_err(|e| CacheUpdateError::Write {
                field: field.clone(),
                detail: e.to_string(),
            })?;
        Ok(true)
    }
}

/// Appends `record` to the list under `field` unless a record with the same
/// id is already there. A missing result, or one without the field, becomes
/// a single-element list.
pub fn apply_insert(
    current: Option<Value>,
    field: &str,
    id_field: &str,
    record: &Value,
) -> Result<Option<Value>, CacheUpdateError> {
    let id = record
        .get(id_field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| CacheUpdateError::MissingId {
            id_field: id_field.to_string(),
        })?;

    let mut result = match current {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => Map::new(),
        Some(_) => {
            return Err(CacheUpdateError::Malformed {
                field: field.to_string(),
            })
        }
    };

    match result.get_mut(field) {
        Some(Value::Array(items)) => {
            if items.iter().any(|item| item.get(id_field) == Some(id)) {
                return Ok(None);
            }
            items.push(record.clone());
        }
        Some(Value::Null) | None => {
            result.insert(field.to_string(), Value::Array(vec![record.clone()]));
        }
        Some(_) => {
            return Err(CacheUpdateError::Malformed {
                field: field.to_string(),
            })
        }
    }
    Ok(Some(Value::Object(result)))
}

/// Filters out of the list under `field` every record whose id matches the
/// payload. The payload is either a bare id or a full record.
pub fn apply_remove(
    current: Option<Value>,
    field: &str,
    id_field: &str,
    payload: &Value,
) -> Result<Option<Value>, CacheUpdateError> {
    let id = removal_id(payload, id_field).ok_or_else(|| CacheUpdateError::MissingId {
        id_field: id_field.to_string(),
    })?;

    let Some(Value::Object(mut result)) = current else {
        return Err(CacheUpdateError::NotCached {
            field: field.to_string(),
        });
    };
    let Some(Value::Array(items)) = result.get_mut(field) else {
        return Err(CacheUpdateError::Malformed {
            field: field.to_string(),
        });
    };

    let before = items.len();
    items.retain(|item| item.get(id_field) != Some(id));
    if items.len() == before {
        return Ok(None);
    }
    Ok(Some(Value::Object(result)))
}

fn removal_id<'a>(payload: &'a Value, id_field: &str) -> Option<&'a Value> {
    match payload {
        Value::String(_) | Value::Number(_) => Some(payload),
        Value::Object(obj) => obj.get(id_field).filter(|v| !v.is_null()),
        _ => None,
    }
}
