//! Sync orchestrator state machine.

use crate::adapter::AdapterRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflicts::{ConflictItem, ConflictService, ResolveConflict, ResolveOutcome};
use crate::dispatch::SyncDispatcher;
use crate::error::{SyncError, SyncResult};
use crate::flight::SingleFlight;
use crate::merge::{Similarity, SmartMergeResolver};
use crate::pull::{PullReport, PullSyncManager};
use crate::queue::{QueueProcessor, QueueReport};
use crate::remap::{IdRemapper, IdentityListener};
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use fieldsync_core::Store;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is pushing the outbox.
    PushInProgress,
    /// A push produced conflicts; push and pull are halted until reset.
    ConflictPending,
    /// Engine is pulling server collections.
    PullInProgress,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::PushInProgress | SyncState::PullInProgress)
    }

    /// Returns true if the engine can start a new run.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::PushInProgress => "push_in_progress",
            SyncState::ConflictPending => "conflict_pending",
            SyncState::PullInProgress => "pull_in_progress",
        };
        f.write_str(name)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Runs that reached the end of the push phase.
    pub runs_completed: u64,
    /// Outbox entries pushed successfully.
    pub records_pushed: u64,
    /// Conflicts raised by pushes.
    pub conflicts_raised: u64,
    /// Server rows inserted or updated by pulls.
    pub rows_pulled: u64,
    /// Pushes that carried an id remap.
    pub remaps: u64,
    /// Last run time.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Push and pull phases both ran.
    Completed,
    /// The push raised conflicts; the pull was not attempted.
    ConflictPending {
        /// Unresolved conflicts after the push.
        conflicts: usize,
    },
}

/// Result of a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRunReport {
    /// Push phase tally.
    pub push: QueueReport,
    /// Pull phase result, when the pull ran.
    pub pull: Option<PullReport>,
    /// Pull failure, reported rather than raised.
    pub pull_error: Option<String>,
    /// How the run ended.
    pub outcome: RunOutcome,
}

impl SyncRunReport {
    /// True when every record was pushed and every collection merged.
    pub fn is_fully_successful(&self) -> bool {
        self.outcome == RunOutcome::Completed
            && self.push.fully_successful()
            && self.pull_error.is_none()
            && self.pull.as_ref().map_or(true, PullReport::is_complete)
    }
}

/// Returns an active state to idle when the run future finishes or is
/// dropped.
struct ActiveGuard<'a>(&'a watch::Sender<SyncState>);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if state.is_active() {
                *state = SyncState::Idle;
                true
            } else {
                false
            }
        });
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    store: Arc<Store>,
    transport: Arc<dyn SyncTransport>,
    clock: Arc<dyn Clock>,
    registry: AdapterRegistry,
    similarity: Option<Arc<dyn Similarity>>,
}

impl SyncEngineBuilder {
    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the adapter registry.
    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the fuzzy-duplicate similarity function.
    pub fn with_similarity(mut self, similarity: Arc<dyn Similarity>) -> Self {
        self.similarity = Some(similarity);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> SyncEngine {
        let Self {
            config,
            store,
            transport,
            clock,
            registry,
            similarity,
        } = self;

        let remapper = Arc::new(IdRemapper::new(store.clone()));
        let dispatcher = SyncDispatcher::new(store.clone(), transport.clone(), registry);
        let queue = QueueProcessor::new(
            store.clone(),
            dispatcher,
            remapper.clone(),
            clock.clone(),
            config.retry.clone(),
        );
        let resolver = match similarity {
            Some(similarity) => {
                SmartMergeResolver::with_similarity(config.fuzzy_match_threshold, similarity)
            }
            None => SmartMergeResolver::new(config.fuzzy_match_threshold),
        };
        let pull = PullSyncManager::new(
            store.clone(),
            transport.clone(),
            resolver,
            remapper.clone(),
            clock.clone(),
            config.pull_collections.clone(),
            config.min_pull_interval,
        )
        .with_bulk_pull(config.bulk_pull);
        let conflicts = ConflictService::new(store.clone(), transport, clock.clone());
        let (state, _) = watch::channel(SyncState::Idle);

        SyncEngine {
            config,
            store,
            clock,
            remapper,
            queue,
            pull,
            conflicts,
            state,
            stats: RwLock::new(SyncStats::default()),
            flight: SingleFlight::new(),
        }
    }
}

/// Coordinates push, conflict gating and pull for one device.
///
/// The engine owns no global state; construct one per store and share it
/// behind an `Arc`.
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    remapper: Arc<IdRemapper>,
    queue: QueueProcessor,
    pull: PullSyncManager,
    conflicts: ConflictService,
    state: watch::Sender<SyncState>,
    stats: RwLock<SyncStats>,
    flight: SingleFlight<SyncRunReport>,
}

impl SyncEngine {
    /// Creates an engine with the system clock and the standard adapters.
    pub fn new(config: SyncConfig, store: Arc<Store>, transport: Arc<dyn SyncTransport>) -> Self {
        Self::builder(config, store, transport).build()
    }

    /// Starts a builder.
    pub fn builder(
        config: SyncConfig,
        store: Arc<Store>,
        transport: Arc<dyn SyncTransport>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            store,
            transport,
            clock: Arc::new(SystemClock),
            registry: AdapterRegistry::standard(),
            similarity: None,
        }
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Registers a listener for active-identity remaps.
    pub fn add_identity_listener(&self, listener: Arc<dyn IdentityListener>) {
        self.remapper.add_listener(listener);
    }

    /// Runs the push phase and, when it raised no conflicts, the pull phase.
    ///
    /// Refused with [`SyncError::ConflictsPending`] while conflicts are
    /// unresolved. A caller arriving mid-run receives that run's report.
    pub async fn run_sync(&self, actor_id: &str) -> SyncResult<SyncRunReport> {
        self.ensure_no_conflicts(actor_id)?;
        let (result, joined) = self.flight.run(self.execute(actor_id)).await;
        if joined {
            tracing::debug!(actor_id, "joined in-flight sync run");
        }
        result
    }

    /// Pulls every collection immediately, ignoring the minimum interval.
    ///
    /// Refused while any run is active or conflicts are unresolved.
    pub async fn pull_only(&self, actor_id: &str) -> SyncResult<PullReport> {
        self.ensure_no_conflicts(actor_id)?;
        if self.flight.is_running() || !self.transition(SyncState::Idle, SyncState::PullInProgress)
        {
            return Err(SyncError::AlreadyRunning);
        }
        let _active = ActiveGuard(&self.state);

        let result = self.pull.pull_forced(actor_id).await;
        let mut stats = self.stats.write();
        match &result {
            Ok(report) => stats.rows_pulled += report.totals.applied() as u64,
            Err(err) => stats.last_error = Some(err.to_string()),
        }
        result
    }

    /// Clears `ConflictPending` once the conflicts have been resolved.
    ///
    /// Returns false when the engine was not in `ConflictPending`.
    pub fn reset(&self) -> bool {
        let cleared = self.transition(SyncState::ConflictPending, SyncState::Idle);
        if cleared {
            tracing::info!("conflict state cleared");
        }
        cleared
    }

    /// Lists unresolved conflicts for `actor_id`.
    pub fn list_conflicts(&self, actor_id: &str) -> Vec<ConflictItem> {
        self.conflicts.list_conflicts(actor_id)
    }

    /// Resolves one conflict. Does not clear `ConflictPending`; call
    /// [`SyncEngine::reset`] once every conflict is handled.
    pub async fn resolve_conflict(
        &self,
        actor_id: &str,
        resolution: ResolveConflict,
    ) -> SyncResult<ResolveOutcome> {
        self.conflicts.resolve_conflict(actor_id, resolution).await
    }

    fn ensure_no_conflicts(&self, actor_id: &str) -> SyncResult<()> {
        if self.state() == SyncState::ConflictPending {
            // Process-wide gate: count every actor's conflicts.
            let count = self.conflicts.total_conflict_count();
            tracing::warn!(actor_id, count, "sync refused; conflicts pending");
            return Err(SyncError::ConflictsPending { count });
        }
        let count = self.conflicts.conflict_count(actor_id);
        if count > 0 {
            self.transition(SyncState::Idle, SyncState::ConflictPending);
            tracing::warn!(actor_id, count, "sync refused; conflicts pending");
            return Err(SyncError::ConflictsPending { count });
        }
        Ok(())
    }

    fn transition(&self, from: SyncState, to: SyncState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(%from, %to, "sync state transition");
        }
        moved
    }

    fn set_state(&self, to: SyncState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::debug!(%from, %to, "sync state transition");
        }
    }

    async fn execute(&self, actor_id: &str) -> SyncResult<SyncRunReport> {
        if !self.transition(SyncState::Idle, SyncState::PushInProgress) {
            return Err(SyncError::AlreadyRunning);
        }
        let _active = ActiveGuard(&self.state);

        let push = match self.queue.process_queue(actor_id).await {
            Ok(push) => push,
            Err(err) => {
                tracing::error!(actor_id, error = %err, "push phase failed");
                self.stats.write().last_error = Some(err.to_string());
                return Err(err);
            }
        };

        let conflicts = self.conflicts.conflict_count(actor_id);
        if conflicts > 0 {
            self.set_state(SyncState::ConflictPending);
            tracing::info!(actor_id, conflicts, "push raised conflicts; pull skipped");
            let report = SyncRunReport {
                push,
                pull: None,
                pull_error: None,
                outcome: RunOutcome::ConflictPending { conflicts },
            };
            self.record_run(&report);
            return Ok(report);
        }

        self.set_state(SyncState::PullInProgress);
        let (pull, pull_error) = match self.pull.pull_all(actor_id).await {
            Ok(pull) => (Some(pull), None),
            Err(err) => {
                tracing::warn!(actor_id, error = %err, "pull phase failed");
                (None, Some(err.to_string()))
            }
        };
        self.set_state(SyncState::Idle);

        let report = SyncRunReport {
            push,
            pull,
            pull_error,
            outcome: RunOutcome::Completed,
        };
        self.record_run(&report);
        tracing::info!(
            actor_id,
            fully_successful = report.is_fully_successful(),
            "sync run finished"
        );
        Ok(report)
    }

    fn record_run(&self, report: &SyncRunReport) {
        let mut stats = self.stats.write();
        stats.runs_completed += 1;
        stats.records_pushed += report.push.succeeded as u64;
        stats.remaps += report.push.remapped as u64;
        stats.conflicts_raised += report.push.conflicts as u64;
        if let Some(pull) = &report.pull {
            stats.rows_pulled += pull.totals.applied() as u64;
        }
        stats.last_run_at = Some(self.clock.now());
        stats.last_error = report
            .pull_error
            .clone()
            .or_else(|| report.pull.as_ref().and_then(|p| p.errors.first()).map(|e| e.message.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryPolicy;
    use crate::transport::{MockTransport, PushReply};
    use fieldsync_core::{EntityRow, EntityType, ResolutionStrategy};
    use fieldsync_protocol::ConflictBody;
    use serde_json::json;

    struct Harness {
        store: Arc<Store>,
        transport: Arc<MockTransport>,
        engine: SyncEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(Store::open_in_memory());
        let transport = Arc::new(MockTransport::new());
        let config = SyncConfig::new("http://localhost:8080")
            .with_retry(RetryPolicy::immediate())
            .with_pull_collections(vec![EntityType::Supply]);
        let engine = SyncEngine::builder(config, store.clone(), transport.clone())
            .with_clock(Arc::new(ManualClock::default()))
            .build();
        Harness {
            store,
            transport,
            engine,
        }
    }

    fn add_supply(store: &Store, id: &str) {
        let row = EntityRow::from_value(json!({"id": id, "name": "Gauze"})).unwrap();
        store
            .record_local_insert(EntityType::Supply, row, "u1", chrono::Utc::now())
            .unwrap();
    }

    fn queue_conflict(transport: &MockTransport) {
        transport.queue_push(Ok(PushReply::Conflict(ConflictBody {
            conflict_field: "name".into(),
            latest_data: json!({"id": "s1", "name": "Bandage"}),
            allowed_strategies: vec![],
            message: None,
        })));
    }

    #[test]
    fn state_helpers() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(!SyncState::ConflictPending.can_start_sync());
        assert!(SyncState::PullInProgress.is_active());
        assert!(!SyncState::ConflictPending.is_active());
        assert_eq!(SyncState::PushInProgress.to_string(), "push_in_progress");
    }

    #[tokio::test]
    async fn clean_run_pushes_then_pulls() {
        let h = harness();
        add_supply(&h.store, "s1");
        h.transport
            .set_pull_rows(EntityType::Supply, vec![json!({"id": "s2", "name": "Tape"})]);

        let report = h.engine.run_sync("u1").await.unwrap();
        assert!(report.is_fully_successful());
        assert_eq!(report.push.succeeded, 1);
        assert_eq!(report.pull.as_ref().unwrap().inserted(), 1);
        assert_eq!(h.engine.state(), SyncState::Idle);

        let stats = h.engine.stats();
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.records_pushed, 1);
        assert_eq!(stats.rows_pulled, 1);
        assert!(stats.last_run_at.is_some());
    }

    #[tokio::test]
    async fn conflict_halts_pull_and_gates_later_runs() {
        let h = harness();
        add_supply(&h.store, "s1");
        queue_conflict(&h.transport);

        let report = h.engine.run_sync("u1").await.unwrap();
        assert_eq!(report.outcome, RunOutcome::ConflictPending { conflicts: 1 });
        assert!(report.pull.is_none());
        assert!(h.transport.pulled().is_empty());
        assert_eq!(h.engine.state(), SyncState::ConflictPending);

        let err = h.engine.run_sync("u1").await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictsPending { count: 1 }));
        let err = h.engine.pull_only("u1").await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictsPending { .. }));
        assert_eq!(h.transport.pushed().len(), 1);
        assert!(h.transport.pulled().is_empty());

        h.engine
            .resolve_conflict(
                "u1",
                ResolveConflict::new(EntityType::Supply, "s1", ResolutionStrategy::ServerWins),
            )
            .await
            .unwrap();
        assert!(h.engine.reset());
        assert!(!h.engine.reset());

        let report = h.engine.run_sync("u1").await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(h.transport.pulled().len(), 1);
    }

    #[tokio::test]
    async fn pending_gate_reports_conflicts_to_other_actors() {
        let h = harness();
        add_supply(&h.store, "s1");
        queue_conflict(&h.transport);
        h.engine.run_sync("u1").await.unwrap();

        let err = h.engine.run_sync("u2").await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictsPending { count: 1 }));
        let err = h.engine.pull_only("u2").await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictsPending { count: 1 }));
    }

    #[tokio::test]
    async fn conflicts_in_store_block_a_fresh_engine() {
        let h = harness();
        add_supply(&h.store, "s1");
        queue_conflict(&h.transport);
        h.engine.run_sync("u1").await.unwrap();

        let transport = Arc::new(MockTransport::new());
        let fresh = SyncEngine::new(SyncConfig::default(), h.store.clone(), transport.clone());
        let err = fresh.run_sync("u1").await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictsPending { count: 1 }));
        assert_eq!(fresh.state(), SyncState::ConflictPending);
        assert!(transport.pushed().is_empty());
    }

    #[tokio::test]
    async fn pull_error_is_reported_not_raised() {
        let h = harness();
        h.transport.fail_pull(EntityType::Supply, SyncError::Timeout);

        let report = h.engine.run_sync("u1").await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(!report.is_fully_successful());
        assert_eq!(report.pull.as_ref().unwrap().errors.len(), 1);
        assert_eq!(h.engine.state(), SyncState::Idle);
        assert!(h.engine.stats().last_error.is_some());
    }

    #[tokio::test]
    async fn pull_only_bypasses_interval() {
        let h = harness();
        h.engine.run_sync("u1").await.unwrap();
        h.engine.run_sync("u1").await.unwrap();
        // The second run's pull was skipped by the interval.
        assert_eq!(h.transport.pulled().len(), 1);

        let report = h.engine.pull_only("u1").await.unwrap();
        assert!(!report.skipped);
        assert_eq!(h.transport.pulled().len(), 2);
        assert_eq!(h.engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let h = harness();
        let mut rx = h.engine.subscribe();
        add_supply(&h.store, "s1");
        queue_conflict(&h.transport);

        h.engine.run_sync("u1").await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SyncState::ConflictPending);
    }

    #[tokio::test]
    async fn concurrent_runs_share_one_result() {
        let h = harness();
        add_supply(&h.store, "s1");

        let (a, b) = tokio::join!(h.engine.run_sync("u1"), h.engine.run_sync("u1"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.is_fully_successful());
        assert!(b.is_fully_successful());
        assert_eq!(h.transport.pushed().len(), 1);
        assert_eq!(h.engine.state(), SyncState::Idle);
    }
}
