//! Replay engine: drains the offline queue against the backend.
//!
//! One pass takes a snapshot of the queue and submits its entries strictly in
//! enqueue order, one at a time. Each entry ends the pass resolved (removed,
//! cache reconciled), failed (removed, listeners told), or back in `pending`
//! after a transient failure, which halts the pass so no later entry can
//! overtake it.
//!
//! Rows the store can no longer decode are quarantined at the start of each
//! pass and reported as failures, so they never block the entries behind
//! them.
//!
//! A version conflict is resolved at most once per entry: the merged record
//! is persisted with `merged = true` and resubmitted immediately, and any
//! further conflict on that entry fails it.

use crate::cache::ReadCache;
use crate::config::ReplayConfig;
use crate::conflict::{
    with_server_version, ClientWins, ConflictContext, ConflictDetector, ConflictStrategy,
    Disposition, Resolution,
};
use crate::context::replay_context;
use crate::error::{SyncError, SyncResult};
use crate::listener::{
    ConflictEvent, ConflictListener, EntryOutcome, OfflineQueueListener, ReplayFailure,
};
use crate::optimistic::create_optimistic_response;
use crate::reconciler::CacheReconciler;
use crate::registry::CacheUpdateRegistry;
use crate::transport::{MutationTransport, SubmitOutcome};
use outbox_store::{QueueStore, StoreError, StoreResult, UndecodableEntry};
use outbox_types::{EntryId, EntryPatch, EntryStatus, NewEntry, Operation, QueueEntry};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Why a replay pass stopped before reaching the end of its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The backend was unreachable; `entry` is pending again.
    Transient { entry: EntryId, reason: String },
    /// The queue store failed.
    Store(String),
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries submitted at least once during the pass.
    pub attempted: usize,
    /// Entries the backend accepted and that were removed from the queue.
    pub succeeded: usize,
    /// Entries removed from the queue without being applied.
    pub failed: usize,
    /// Undecodable rows moved out of the queue before replay started.
    pub quarantined: usize,
    /// Set when the pass stopped before the end of its snapshot.
    pub halted: Option<HaltReason>,
}

impl ReplayReport {
    /// True if the pass reached the end of its snapshot.
    pub fn is_complete(&self) -> bool {
        self.halted.is_none()
    }
}

/// Per-entry result within a pass.
enum Step {
    Resolved,
    Failed,
    Halted(String),
    /// Removed from the store by someone else before it was submitted.
    Skipped,
}

type Waiters = HashMap<EntryId, Vec<oneshot::Sender<EntryOutcome>>>;

/// The offline replay orchestrator.
pub struct ReplayEngine {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn MutationTransport>,
    reconciler: CacheReconciler,
    strategy: Arc<dyn ConflictStrategy>,
    queue_listener: Option<Arc<dyn OfflineQueueListener>>,
    conflict_listener: Option<Arc<dyn ConflictListener>>,
    config: ReplayConfig,
    span: Span,
    /// Held for the duration of a pass; passes never overlap.
    pass_lock: tokio::sync::Mutex<()>,
    waiters: Mutex<Waiters>,
}

impl ReplayEngine {
    /// Starts configuring an engine over its three collaborators.
    pub fn builder(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MutationTransport>,
        cache: Arc<dyn ReadCache>,
    ) -> ReplayEngineBuilder {
        ReplayEngineBuilder {
            store,
            transport,
            cache,
            registry: CacheUpdateRegistry::empty(),
            strategy: Arc::new(ClientWins),
            queue_listener: None,
            conflict_listener: None,
            config: ReplayConfig::default(),
            span: None,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Returns the cache update registry.
    pub fn registry(&self) -> &CacheUpdateRegistry {
        self.reconciler.registry()
    }

    // ── Enqueue ──────────────────────────────────────────────────

    /// Queues a mutation the application issued while disconnected.
    pub async fn enqueue_offline(
        &self,
        operation: Operation,
        variables: Value,
        conflict_base: Option<Value>,
        return_type: Option<String>,
    ) -> SyncResult<EntryId> {
        let mut entry = NewEntry::new(operation, variables);
        entry.conflict_base = conflict_base;
        entry.return_type = return_type;
        self.enqueue(entry).await
    }

    /// Queues a fully described mutation. Synthesizes an optimistic
    /// response when none is given, the return type is known and the
    /// operation has a registered cache update.
    pub async fn enqueue(&self, mut entry: NewEntry) -> SyncResult<EntryId> {
        if entry.optimistic_response.is_none() {
            if let (Some(return_type), Some(update)) = (
                entry.return_type.as_deref(),
                self.registry().get(&entry.operation.name),
            ) {
                let id_field = update.id_field().unwrap_or(&self.config.id_field);
                entry.optimistic_response = Some(create_optimistic_response(
                    return_type,
                    &entry.variables,
                    update.operation(),
                    id_field,
                ));
            }
        }

        let name = entry.operation.name.clone();
        let id = self.blocking(move |s| s.enqueue(entry)).await?;
        debug!("Queued offline mutation {} as {}", name, id);
        Ok(id)
    }

    // ── Inspection ───────────────────────────────────────────────

    /// Returns the queued entries, oldest first.
    pub async fn pending_entries(&self) -> SyncResult<Vec<QueueEntry>> {
        self.blocking(|s| s.drain_ordered()).await
    }

    /// Returns the number of queued entries.
    pub async fn queue_len(&self) -> SyncResult<usize> {
        self.blocking(|s| s.len()).await
    }

    /// Returns a receiver for the terminal outcome of a queued entry.
    ///
    /// The receiver errors if the entry is no longer queued, including when
    /// something other than this engine removes it before it is replayed.
    /// Outcomes are only delivered within this process; waiters do not
    /// survive restart.
    pub async fn watch(&self, id: &EntryId) -> SyncResult<oneshot::Receiver<EntryOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.waiters().entry(*id).or_default().push(tx);

        let key = *id;
        match self.blocking(move |s| s.get(&key)).await {
            Ok(Some(_)) => Ok(rx),
            Ok(None) => {
                self.waiters().remove(id);
                Ok(rx)
            }
            Err(e) => {
                self.waiters().remove(id);
                Err(e)
            }
        }
    }

    // ── Replay ───────────────────────────────────────────────────

    /// Process-init drain: resets entries interrupted by a crash, then
    /// replays the whole queue once.
    pub async fn start(&self) -> ReplayReport {
        self.run_pass(true).instrument(self.span.clone()).await
    }

    /// Drains the persisted queue in order. Never fails: store errors and
    /// transient failures end the pass and are reported in the result.
    pub async fn replay_all(&self) -> ReplayReport {
        self.run_pass(false).instrument(self.span.clone()).await
    }

    /// Replays the queue every time `online` goes from false to true.
    pub fn spawn_connectivity_watcher(
        self: Arc<Self>,
        mut online: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let span = self.span.clone();
        tokio::spawn(
            async move {
                let mut was_online = *online.borrow_and_update();
                while online.changed().await.is_ok() {
                    let is_online = *online.borrow_and_update();
                    if is_online && !was_online {
                        info!("Connectivity restored, replaying offline queue");
                        let report = self.run_pass(false).await;
                        if let Some(halt) = &report.halted {
                            debug!("Replay halted: {:?}", halt);
                        }
                    }
                    was_online = is_online;
                }
                debug!("Connectivity signal closed");
            }
            .instrument(span),
        )
    }

    async fn run_pass(&self, recover: bool) -> ReplayReport {
        let _pass = self.pass_lock.lock().await;
        let mut report = ReplayReport::default();

        if recover {
            match self.blocking(|s| s.recover_in_flight()).await {
                Ok(0) => {}
                Ok(n) => info!("Recovered {} interrupted mutations", n),
                Err(e) => warn!("Failed to recover interrupted mutations: {}", e),
            }
        }
        report.quarantined = self.quarantine().await;

        let entries = match self.blocking(|s| s.drain_ordered()).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read offline queue: {}", e);
                report.halted = Some(HaltReason::Store(e.to_string()));
                return report;
            }
        };
        self.prune_waiters(&entries).await;
        if entries.is_empty() {
            debug!("Offline queue is empty");
            return report;
        }
        info!("Replaying {} queued mutations", entries.len());

        for entry in entries {
            let id = entry.id;
            match self.process_entry(entry).await {
                Ok(Step::Resolved) => {
                    report.attempted += 1;
                    report.succeeded += 1;
                }
                Ok(Step::Failed) => {
                    report.attempted += 1;
                    report.failed += 1;
                }
                Ok(Step::Halted(reason)) => {
                    report.attempted += 1;
                    report.halted = Some(HaltReason::Transient { entry: id, reason });
                    break;
                }
                Ok(Step::Skipped) => debug!("Entry {} left the queue before replay", id),
                Err(e) => {
                    warn!("Queue store failed while replaying {}: {}", id, e);
                    report.halted = Some(HaltReason::Store(e.to_string()));
                    break;
                }
            }
        }

        info!(
            "Replay pass: {} attempted, {} succeeded, {} failed{}",
            report.attempted,
            report.succeeded,
            report.failed,
            if report.is_complete() { "" } else { ", halted" }
        );
        report
    }

    async fn process_entry(&self, mut entry: QueueEntry) -> SyncResult<Step> {
        loop {
            entry.attempts += 1;
            entry.status = EntryStatus::InFlight;
            let patch = EntryPatch {
                status: Some(EntryStatus::InFlight),
                attempts: Some(entry.attempts),
                variables: entry.merged.then(|| entry.variables.clone()),
                merged: entry.merged.then_some(true),
            };
            match self.update(entry.id, patch).await {
                Ok(()) => {}
                Err(SyncError::Store(StoreError::NotFound(_))) => return Ok(Step::Skipped),
                Err(e) => return Err(e),
            }

            let outcome = self.submit(&entry).await;
            match ConflictDetector::classify(outcome) {
                Disposition::Commit(data) => return self.commit(&entry, data).await,
                Disposition::Retry(reason) => return self.retry_later(&entry, reason).await,
                Disposition::Reject(reason) => {
                    return self.fail(&entry, ReplayFailure::Rejected(reason)).await
                }
                Disposition::Resolve(server_data) => match self.resolve(&entry, server_data) {
                    Ok(merged) => {
                        debug!("Resubmitting merged {} ({})", entry.operation_name(), entry.id);
                        entry.variables = merged;
                        entry.merged = true;
                    }
                    Err(failure) => return self.fail(&entry, failure).await,
                },
            }
        }
    }

    async fn submit(&self, entry: &QueueEntry) -> SubmitOutcome {
        let context = replay_context(entry);
        let call = self
            .transport
            .submit(&entry.operation, &entry.variables, &context);
        match self.config.submit_timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => SubmitOutcome::TransientFailure(format!(
                    "no response within {}ms",
                    limit.as_millis()
                )),
            },
            None => call.await,
        }
    }

    /// Runs the conflict strategy and fires the matching listener event.
    /// Returns the record to resubmit, or why the entry fails.
    fn resolve(&self, entry: &QueueEntry, server_data: Value) -> Result<Value, ReplayFailure> {
        let mut event = ConflictEvent {
            entry_id: entry.id,
            operation_name: entry.operation_name().to_string(),
            base: entry.conflict_base.clone().unwrap_or(Value::Null),
            server_data,
            client_data: entry.variables.clone(),
            merged: None,
            conflicting_fields: Vec::new(),
        };
        let ctx = ConflictContext {
            base: &event.base,
            server: &event.server_data,
            client: &event.client_data,
            operation_name: entry.operation_name(),
            id_field: &self.config.id_field,
            version_field: &self.config.version_field,
        };
        let analysis = ctx.analyze();

        if entry.merged {
            event.conflicting_fields = analysis.hard_conflicts.into_iter().collect();
            info!("Conflict on merged resubmission of {}", entry.id);
            self.emit_conflict(&event);
            return Err(ReplayFailure::ConflictAfterMerge);
        }

        let resolution = self.strategy.resolve(&ctx);
        let mergeable = analysis.is_mergeable();
        event.conflicting_fields = analysis.hard_conflicts.into_iter().collect();

        match resolution {
            Resolution::Unresolved(reason) => {
                info!("Unresolved conflict on {}: {}", entry.id, reason);
                self.emit_conflict(&event);
                Err(ReplayFailure::Unresolved(reason))
            }
            Resolution::Merged(merged) => {
                let merged =
                    with_server_version(merged, &event.server_data, &self.config.version_field);
                event.merged = Some(merged.clone());
                if mergeable {
                    debug!("Merged concurrent edits on {}", entry.id);
                    if let Some(listener) = &self.conflict_listener {
                        listener.merge_occurred(&event);
                    }
                } else {
                    info!(
                        "Conflicting fields on {} ({}), resubmitting resolved record",
                        entry.id,
                        event.conflicting_fields.join(", ")
                    );
                    self.emit_conflict(&event);
                }
                Ok(merged)
            }
        }
    }

    /// Moves undecodable rows out of the queue and reports each one as
    /// failed. Returns how many were moved.
    async fn quarantine(&self) -> usize {
        let rows = match self.blocking(|s| s.quarantine_undecodable()).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to quarantine undecodable entries: {}", e);
                return 0;
            }
        };
        for row in &rows {
            self.reject_undecodable(row);
        }
        rows.len()
    }

    fn reject_undecodable(&self, row: &UndecodableEntry) {
        warn!(
            "Dropping undecodable queued {} ({}): {}",
            row.operation_name, row.id, row.reason
        );
        if let Some(listener) = &self.queue_listener {
            listener.on_operation_undecodable(row);
        }
        if let Some(id) = row.entry_id() {
            self.notify(
                id,
                EntryOutcome::Failed(ReplayFailure::Undecodable(row.reason.clone())),
            );
        }
    }

    /// Closes waiters for entries that left the queue without this engine
    /// replaying them.
    async fn prune_waiters(&self, snapshot: &[QueueEntry]) {
        let queued: HashSet<EntryId> = snapshot.iter().map(|e| e.id).collect();
        let unseen: Vec<EntryId> = self
            .waiters()
            .keys()
            .filter(|id| !queued.contains(id))
            .copied()
            .collect();
        if unseen.is_empty() {
            return;
        }

        // Entries enqueued after the snapshot are still present and keep
        // their waiters.
        let gone = self
            .blocking(move |s| {
                let mut gone = Vec::new();
                for id in unseen {
                    if s.get(&id)?.is_none() {
                        gone.push(id);
                    }
                }
                Ok(gone)
            })
            .await;
        match gone {
            Ok(gone) => {
                let mut waiters = self.waiters();
                for id in gone {
                    if waiters.remove(&id).is_some() {
                        debug!("Entry {} left the queue, closing its waiters", id);
                    }
                }
            }
            Err(e) => warn!("Failed to check watched entries: {}", e),
        }
    }

    fn emit_conflict(&self, event: &ConflictEvent) {
        if let Some(listener) = &self.conflict_listener {
            listener.conflict_occurred(event);
        }
    }

    async fn commit(&self, entry: &QueueEntry, data: Value) -> SyncResult<Step> {
        let report = self.reconciler.reconcile(entry.operation_name(), &data).await;
        for error in &report.errors {
            warn!(
                "Cache update for {} failed: {}",
                entry.operation_name(),
                error
            );
        }

        self.remove(entry.id).await?;
        debug!("Replayed {} ({})", entry.operation_name(), entry.id);
        if let Some(listener) = &self.queue_listener {
            listener.on_operation_success(entry, &data);
        }
        self.notify(entry.id, EntryOutcome::Resolved(data));
        Ok(Step::Resolved)
    }

    async fn fail(&self, entry: &QueueEntry, failure: ReplayFailure) -> SyncResult<Step> {
        warn!(
            "Dropping queued {} ({}): {}",
            entry.operation_name(),
            entry.id,
            failure
        );
        self.remove(entry.id).await?;
        if let Some(listener) = &self.queue_listener {
            listener.on_operation_failure(entry, &failure);
        }
        self.notify(entry.id, EntryOutcome::Failed(failure));
        Ok(Step::Failed)
    }

    async fn retry_later(&self, entry: &QueueEntry, reason: String) -> SyncResult<Step> {
        if let Some(max) = self.config.max_transient_attempts {
            if entry.attempts >= max {
                let failure = ReplayFailure::RetriesExhausted {
                    attempts: entry.attempts,
                    reason,
                };
                return self.fail(entry, failure).await;
            }
        }

        self.update(entry.id, EntryPatch::status(EntryStatus::Pending))
            .await?;
        info!(
            "Backend unreachable replaying {} ({}): {}; pausing replay",
            entry.operation_name(),
            entry.id,
            reason
        );
        Ok(Step::Halted(reason))
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, id: EntryId, outcome: EntryOutcome) {
        let senders = self.waiters().remove(&id).unwrap_or_default();
        for tx in senders {
            let _ = tx.send(outcome.clone());
        }
    }

    async fn update(&self, id: EntryId, patch: EntryPatch) -> SyncResult<()> {
        self.blocking(move |s| s.update(&id, &patch)).await
    }

    async fn remove(&self, id: EntryId) -> SyncResult<bool> {
        self.blocking(move |s| s.remove(&id)).await
    }

    /// Runs a store call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&dyn QueueStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
            .map_err(SyncError::from)
    }
}

/// Configures a [`ReplayEngine`].
pub struct ReplayEngineBuilder {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn MutationTransport>,
    cache: Arc<dyn ReadCache>,
    registry: CacheUpdateRegistry,
    strategy: Arc<dyn ConflictStrategy>,
    queue_listener: Option<Arc<dyn OfflineQueueListener>>,
    conflict_listener: Option<Arc<dyn ConflictListener>>,
    config: ReplayConfig,
    span: Option<Span>,
}

impl ReplayEngineBuilder {
    /// Sets the cache update registry. Defaults to an empty one.
    #[must_use]
    pub fn registry(mut self, registry: CacheUpdateRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the conflict strategy. Defaults to [`ClientWins`].
    #[must_use]
    pub fn strategy(mut self, strategy: impl ConflictStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Sets the listener told about every entry's terminal outcome.
    #[must_use]
    pub fn queue_listener(mut self, listener: Arc<dyn OfflineQueueListener>) -> Self {
        self.queue_listener = Some(listener);
        self
    }

    /// Sets the listener told about conflicts and merges.
    #[must_use]
    pub fn conflict_listener(mut self, listener: Arc<dyn ConflictListener>) -> Self {
        self.conflict_listener = Some(listener);
        self
    }

    /// Sets timeouts, retry bounds and record field names. Checked by
    /// [`build`](Self::build).
    #[must_use]
    pub fn config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the span the engine logs under. Defaults to `offline_replay`.
    #[must_use]
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> SyncResult<ReplayEngine> {
        self.config.validate()?;
        Ok(ReplayEngine {
            store: self.store,
            transport: self.transport,
            reconciler: CacheReconciler::new(self.cache, Arc::new(self.registry)),
            strategy: self.strategy,
            queue_listener: self.queue_listener,
            conflict_listener: self.conflict_listener,
            config: self.config,
            span: self.span.unwrap_or_else(|| info_span!("offline_replay")),
            pass_lock: tokio::sync::Mutex::new(()),
            waiters: Mutex::new(HashMap::new()),
        })
    }
}
