//! Read cache boundary.
//!
//! The local read cache is owned by the host. The core only issues single
//! `read` and `write` calls against it and assumes no atomicity beyond that.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A cached query: its document, variables, and the top-level field its
/// result set lives under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Top-level result field, e.g. `allTasks`.
    pub result_field: String,
    /// Query document, opaque to the core.
    #[serde(default)]
    pub document: String,
    /// Query variables.
    #[serde(default)]
    pub variables: Value,
}

impl QueryDescriptor {
    /// Creates a descriptor for a query without variables.
    pub fn new(result_field: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            result_field: result_field.into(),
            document: document.into(),
            variables: Value::Null,
        }
    }

    /// Sets the query variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Key identifying this query and its variables in a flat cache.
    pub fn cache_key(&self) -> String {
        format!("{}({})", self.result_field, self.variables)
    }
}

/// Errors a read cache can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache read failed: {0}")]
    Read(String),

    #[error("cache write failed: {0}")]
    Write(String),
}

/// The host's local query cache.
#[async_trait]
pub trait ReadCache: Send + Sync {
    /// Reads the cached result of a query. `Ok(None)` means not cached.
    async fn read(&self, query: &QueryDescriptor) -> Result<Option<Value>, CacheError>;

    /// Replaces the cached result of a query.
    async fn write(&self, query: &QueryDescriptor, result: Value) -> Result<(), CacheError>;
}

/// A simple in-memory cache.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard};

    /// Query results keyed by [`QueryDescriptor::cache_key`], with switches
    /// to make reads or writes fail.
    #[derive(Default)]
    pub struct MemoryCache {
        results: Mutex<HashMap<String, Value>>,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
        writes: AtomicUsize,
    }

    impl MemoryCache {
        pub fn new() -> Self {
            Self::default()
        }

        fn results(&self) -> MutexGuard<'_, HashMap<String, Value>> {
            self.results.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Seeds a query result directly.
        pub fn put(&self, query: &QueryDescriptor, result: Value) {
            self.results().insert(query.cache_key(), result);
        }

        /// Returns the cached result of a query.
        pub fn get(&self, query: &QueryDescriptor) -> Option<Value> {
            self.results().get(&query.cache_key()).cloned()
        }

        /// Returns the list under the query's result field, if any.
        pub fn list(&self, query: &QueryDescriptor) -> Vec<Value> {
            self.get(query)
                .and_then(|r| r.get(&query.result_field).and_then(Value::as_array).cloned())
                .unwrap_or_default()
        }

        pub fn set_fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        /// Number of successful writes so far.
        pub fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadCache for MemoryCache {
        async fn read(&self, query: &QueryDescriptor) -> Result<Option<Value>, CacheError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(CacheError::Read("reads disabled".to_string()));
            }
            Ok(self.get(query))
        }

        async fn write(&self, query: &QueryDescriptor, result: Value) -> Result<(), CacheError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(CacheError::Write("writes disabled".to_string()));
            }
            self.put(query, result);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
