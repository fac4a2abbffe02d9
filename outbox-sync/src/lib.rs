//! Offline mutation replay for outbox.
//!
//! Mutations issued while disconnected are persisted in a [`QueueStore`] and
//! replayed in order once the backend is reachable again.
//!
//! # Architecture
//!
//! - **Transport**: [`MutationTransport`] submits one mutation and returns a
//!   classified [`SubmitOutcome`]
//! - **Conflicts**: [`ConflictDetector`] routes outcomes, a
//!   [`ConflictStrategy`] merges base, server, and client records
//! - **Cache**: [`CacheReconciler`] folds committed results into the host's
//!   [`ReadCache`] per the [`CacheUpdateRegistry`]
//! - **Engine**: [`ReplayEngine`] drives the queue and fires listener events
//!
//! ## Replay
//!
//! 1. **Snapshot**: read the queue, oldest first
//! 2. **Submit**: one entry at a time, with its [`ReplayContext`]
//! 3. **Resolve**: on a version conflict, merge once and resubmit
//! 4. **Reconcile**: on success, update cached queries and drop the entry
//! 5. **Halt**: on a transient failure, keep the entry and stop the pass
//!
//! # Example
//!
//! ```
//! use outbox_store::MemoryQueueStore;
//! use outbox_sync::cache::memory::MemoryCache;
//! use outbox_sync::transport::mock::{MockBackend, MockOp};
//! use outbox_sync::{CacheUpdateRegistry, QueryDescriptor, ReplayEngine};
//! use outbox_types::Operation;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let backend = Arc::new(MockBackend::new().with_operation("createTask", MockOp::Create));
//! let registry = CacheUpdateRegistry::builder()
//!     .insert("createTask", [QueryDescriptor::new("allTasks", "")], "id")
//!     .build()
//!     .unwrap();
//!
//! let engine = ReplayEngine::builder(
//!     Arc::new(MemoryQueueStore::new()),
//!     backend.clone(),
//!     Arc::new(MemoryCache::new()),
//! )
//! .registry(registry)
//! .build()
//! .unwrap();
//!
//! engine
//!     .enqueue_offline(Operation::named("createTask"), json!({ "title": "a" }), None, None)
//!     .await
//!     .unwrap();
//!
//! let report = engine.replay_all().await;
//! assert_eq!(report.succeeded, 1);
//! assert_eq!(backend.records().len(), 1);
//! # });
//! ```

pub mod cache;
pub mod config;
pub mod conflict;
pub mod context;
mod engine;
mod error;
pub mod listener;
pub mod optimistic;
pub mod reconciler;
pub mod registry;
pub mod transport;

pub use cache::{CacheError, QueryDescriptor, ReadCache};
pub use config::ReplayConfig;
pub use conflict::{
    analyze, with_server_version, ClientWins, ConflictAnalysis, ConflictContext,
    ConflictDetector, ConflictStrategy, Disposition, FieldMerge, FnStrategy, Resolution,
};
pub use context::{replay_context, ReplayContext};
pub use engine::{HaltReason, ReplayEngine, ReplayEngineBuilder, ReplayReport};
pub use error::{SyncError, SyncResult};
pub use listener::{
    ConflictEvent, ConflictListener, EntryOutcome, OfflineQueueListener, ReplayFailure,
};
pub use optimistic::{create_optimistic_response, is_client_id};
pub use reconciler::{apply_insert, apply_remove, CacheReconciler, CacheUpdateError, ReconcileReport};
pub use registry::{
    CacheOperation, CacheUpdate, CacheUpdateRegistry, CacheUpdateRegistryBuilder, CacheUpdateSpec,
    UpdateTarget,
};
pub use transport::{MutationTransport, SubmitOutcome};

pub use outbox_store::{QueueStore, UndecodableEntry};
