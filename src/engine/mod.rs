//! Forwarding engine: task registry, routing and lifecycle.
//!
//! The engine owns the task -> worker map and publishes an immutable routing
//! snapshot through `ArcSwap` after every change. Dispatch reads only the
//! snapshot, so inbound events never wait on registration or reloads.

pub mod routing;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::{Sinks, Translator};
use crate::config::EngineConfig;
use crate::error::{Error, StoreError, TaskError};
use crate::pipeline::types::{InboundMessage, MessagePayload};
use crate::store::ConfigStore;
use crate::task::Task;
use crate::worker::{
    FailureReason, ForwardingLogEntry, LogRecorder, LogStatus, StatsSnapshot, TaskRuntime,
    TaskWorker, WorkerDeps, WorkerHandle, WorkerLifecycle, WorkerState,
};

pub use routing::{Route, RoutingIndex};

/// What `register_task` did with a task definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    /// A new worker was started.
    Started,
    /// The running worker picked up the new configuration.
    Reloaded,
    /// Identical to what is already running.
    Unchanged,
    /// The task is switched off; any running worker was stopped.
    Inactive,
    /// The task no longer exists in the store; any running worker was stopped.
    Removed,
}

/// Per-event dispatch summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Tasks subscribed to the event's source.
    pub matched: usize,
    /// Tasks whose queue accepted the event.
    pub enqueued: usize,
    /// Tasks whose queue was full or closed.
    pub dropped: usize,
}

/// Result of diffing the store against the running workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub started: Vec<i64>,
    pub reloaded: Vec<i64>,
    pub unchanged: Vec<i64>,
    pub stopped: Vec<i64>,
    pub invalid: Vec<i64>,
}

impl ReloadReport {
    pub fn changed(&self) -> bool {
        !(self.started.is_empty()
            && self.reloaded.is_empty()
            && self.stopped.is_empty()
            && self.invalid.is_empty())
    }
}

struct WorkerEntry {
    handle: WorkerHandle,
    task: Arc<Task>,
    route: Arc<Route>,
}

/// Multi-tenant forwarding engine.
pub struct ForwardingEngine {
    config: EngineConfig,
    store: Arc<dyn ConfigStore>,
    deps: WorkerDeps,
    translator: Option<Arc<dyn Translator>>,
    routing: ArcSwap<RoutingIndex>,
    workers: RwLock<HashMap<i64, WorkerEntry>>,
    /// Tasks rejected at registration, with the reason last reported.
    inert: Mutex<HashMap<i64, String>>,
    log_writer: Mutex<Option<JoinHandle<()>>>,
}

impl ForwardingEngine {
    /// Create an engine and start its log writer. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ConfigStore>,
        sinks: Sinks,
        translator: Option<Arc<dyn Translator>>,
    ) -> Self {
        let (recorder, log_writer) = LogRecorder::spawn(store.clone(), config.log_buffer);
        let deps = WorkerDeps::new(sinks, recorder, &config);
        Self {
            config,
            store,
            deps,
            translator,
            routing: ArcSwap::from_pointee(RoutingIndex::default()),
            workers: RwLock::new(HashMap::new()),
            inert: Mutex::new(HashMap::new()),
            log_writer: Mutex::new(Some(log_writer)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ConfigStore> {
        self.store.clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start a worker for the task, or hot-reload the one already running.
    ///
    /// An invalid task is marked inert, any worker it had is stopped, and
    /// the problem is logged once per distinct reason.
    pub async fn register_task(&self, task: Task) -> Result<RegistrationOutcome, TaskError> {
        let task_id = task.id;

        if !task.active {
            self.clear_inert(task_id);
            if self.stop_worker(task_id).await.is_some() {
                info!(task_id, "Task deactivated, worker stopped");
            }
            return Ok(RegistrationOutcome::Inactive);
        }

        let runtime = match TaskRuntime::compile(task, &self.config, self.translator.clone()) {
            Ok(runtime) => runtime,
            Err(e) => {
                self.stop_worker(task_id).await;
                self.mark_inert(task_id, &e);
                return Err(e);
            }
        };
        self.clear_inert(task_id);

        let mut workers = self.workers.write().await;

        if let Some(entry) = workers.get_mut(&task_id) {
            if *entry.task == *runtime.task {
                return Ok(RegistrationOutcome::Unchanged);
            }

            let task = runtime.task.clone();
            entry.handle.reload(runtime).await?;
            if entry.task.source_ids() != task.source_ids() {
                entry.route = Arc::new(Route {
                    task_id,
                    tx: entry.handle.sender(),
                    stats: entry.handle.stats(),
                    sources: task.source_ids(),
                });
            }
            entry.task = task;
            self.publish(&workers);
            info!(task_id, "Task reloaded");
            return Ok(RegistrationOutcome::Reloaded);
        }

        let task = runtime.task.clone();
        let handle = TaskWorker::spawn(runtime, self.deps.clone());
        let route = Arc::new(Route {
            task_id,
            tx: handle.sender(),
            stats: handle.stats(),
            sources: task.source_ids(),
        });
        info!(
            task_id,
            name = %task.name,
            sources = route.sources.len(),
            targets = task.active_targets().count(),
            "Task registered"
        );
        workers.insert(
            task_id,
            WorkerEntry {
                handle,
                task,
                route,
            },
        );
        self.publish(&workers);
        Ok(RegistrationOutcome::Started)
    }

    /// Remove the task's routes, then drain its worker.
    pub async fn unregister_task(&self, task_id: i64) -> Result<WorkerLifecycle, TaskError> {
        self.clear_inert(task_id);
        match self.stop_worker(task_id).await {
            Some(result) => {
                let lifecycle = result?;
                info!(task_id, "Task unregistered");
                Ok(lifecycle)
            }
            None => Err(TaskError::NotFound { task_id }),
        }
    }

    /// Re-read one task from the store and apply it.
    pub async fn reload_task(&self, task_id: i64) -> Result<RegistrationOutcome, Error> {
        match self.store.load_task(task_id).await? {
            Some(task) => Ok(self.register_task(task).await?),
            None => {
                self.clear_inert(task_id);
                if let Some(result) = self.stop_worker(task_id).await {
                    result?;
                }
                Ok(RegistrationOutcome::Removed)
            }
        }
    }

    /// Persist the active flag, then start or stop the worker to match.
    pub async fn set_task_active(
        &self,
        task_id: i64,
        active: bool,
    ) -> Result<RegistrationOutcome, Error> {
        self.store.set_task_active(task_id, active).await?;
        self.reload_task(task_id).await
    }

    /// Register every active task in the store. Intended for startup.
    pub async fn load_from_store(&self) -> Result<ReloadReport, StoreError> {
        let report = self.reload_from_store().await?;
        info!(
            running = report.started.len() + report.reloaded.len() + report.unchanged.len(),
            invalid = report.invalid.len(),
            "Tasks loaded from store"
        );
        Ok(report)
    }

    /// Bring the running workers in line with the store.
    ///
    /// New and changed tasks are registered, tasks that disappeared or were
    /// switched off are drained. If the store cannot be read, nothing
    /// changes and the engine keeps forwarding with what it has.
    pub async fn reload_from_store(&self) -> Result<ReloadReport, StoreError> {
        let tasks = match self.store.load_all_active_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Store unavailable, keeping last known configuration");
                return Err(e);
            }
        };

        let mut report = ReloadReport::default();
        let wanted: HashSet<i64> = tasks.iter().map(|t| t.id).collect();

        let running: Vec<i64> = self.workers.read().await.keys().copied().collect();
        for task_id in running.into_iter().filter(|id| !wanted.contains(id)) {
            if let Some(result) = self.stop_worker(task_id).await {
                if let Err(e) = result {
                    warn!(task_id, error = %e, "Worker did not drain cleanly");
                }
                report.stopped.push(task_id);
            }
        }
        self.inert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| wanted.contains(id));

        for task in tasks {
            let task_id = task.id;
            match self.register_task(task).await {
                Ok(RegistrationOutcome::Started) => report.started.push(task_id),
                Ok(RegistrationOutcome::Reloaded) => report.reloaded.push(task_id),
                Ok(RegistrationOutcome::Unchanged) => report.unchanged.push(task_id),
                Ok(RegistrationOutcome::Inactive | RegistrationOutcome::Removed) => {
                    report.stopped.push(task_id)
                }
                Err(_) => report.invalid.push(task_id),
            }
        }

        if report.changed() {
            info!(
                started = report.started.len(),
                reloaded = report.reloaded.len(),
                stopped = report.stopped.len(),
                invalid = report.invalid.len(),
                "Configuration reloaded"
            );
        } else {
            debug!(tasks = report.unchanged.len(), "Configuration unchanged");
        }
        Ok(report)
    }

    /// Drain every worker and write a final statistics snapshot for each.
    pub async fn shutdown(&self) -> Vec<WorkerLifecycle> {
        let entries: Vec<WorkerEntry> = {
            let mut workers = self.workers.write().await;
            let entries = workers.drain().map(|(_, e)| e).collect();
            self.publish(&workers);
            entries
        };
        info!(workers = entries.len(), "Shutting down");

        let mut routes = Vec::with_capacity(entries.len());
        let mut drains = Vec::with_capacity(entries.len());
        for entry in entries {
            routes.push(entry.route);
            drains.push(entry.handle.drain());
        }
        let results = join_all(drains).await;

        for route in &routes {
            let snapshot = route.stats.snapshot(route.task_id);
            if let Err(e) = self.store.persist_stats_snapshot(&snapshot).await {
                warn!(task_id = route.task_id, error = %e, "Failed to persist final statistics");
            }
        }

        results
            .into_iter()
            .filter_map(|r| match r {
                Ok(lifecycle) => Some(lifecycle),
                Err(e) => {
                    error!(error = %e, "Worker shutdown failed");
                    None
                }
            })
            .collect()
    }

    /// Hand over the log writer so the caller can await it after the engine
    /// is dropped.
    pub fn take_log_writer(&self) -> Option<JoinHandle<()>> {
        self.log_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Enqueue an event on every worker subscribed to its source. Never
    /// waits: a full queue drops the event for that task only.
    pub fn dispatch(&self, message: InboundMessage) -> DispatchReport {
        let index = self.routing.load();
        let routes = index.routes_for(message.source_id);
        let mut report = DispatchReport {
            matched: routes.len(),
            ..Default::default()
        };

        for route in routes {
            match route.tx.try_send(message.clone()) {
                Ok(()) => report.enqueued += 1,
                Err(mpsc::error::TrySendError::Full(message)) => {
                    report.dropped += 1;
                    warn!(
                        task_id = route.task_id,
                        source = message.source_id,
                        message_id = message.message_id,
                        "Worker queue full, dropping event"
                    );
                    self.record_drop(route, &message, FailureReason::Backpressure, "queue full");
                }
                Err(mpsc::error::TrySendError::Closed(message)) => {
                    report.dropped += 1;
                    debug!(task_id = route.task_id, "Worker queue closed, dropping event");
                    self.record_drop(route, &message, FailureReason::Cancelled, "worker stopping");
                }
            }
        }

        if report.matched == 0 {
            debug!(source = message.source_id, "No task listens to source");
        }
        report
    }

    /// Inbound entry point for source listeners.
    pub fn on_message(
        &self,
        source_id: i64,
        payload: MessagePayload,
        metadata: serde_json::Value,
    ) -> DispatchReport {
        self.dispatch(InboundMessage::from_payload(source_id, payload, metadata))
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Counters for one task, or the sum over every running task.
    /// Reads atomics only.
    pub fn statistics(&self, task_id: Option<i64>) -> Option<StatsSnapshot> {
        let index = self.routing.load();
        match task_id {
            Some(id) => index.route(id).map(|r| r.stats.snapshot(id)),
            None => {
                let snapshots: Vec<StatsSnapshot> =
                    index.routes().map(|r| r.stats.snapshot(r.task_id)).collect();
                Some(StatsSnapshot::aggregate(&snapshots))
            }
        }
    }

    /// Ids of tasks with a running worker.
    pub fn task_ids(&self) -> Vec<i64> {
        self.routing.load().task_ids()
    }

    pub async fn worker_state(&self, task_id: i64) -> Option<WorkerState> {
        let workers = self.workers.read().await;
        match workers.get(&task_id) {
            Some(entry) => Some(entry.handle.state().await),
            None => None,
        }
    }

    /// Tasks rejected as invalid, with the reason.
    pub fn inert_tasks(&self) -> HashMap<i64, String> {
        self.inert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Live feed of forwarding log entries.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<ForwardingLogEntry> {
        self.deps.recorder.subscribe()
    }

    /// Write a statistics snapshot for every running task.
    pub async fn flush_statistics(&self) -> usize {
        let snapshots: Vec<StatsSnapshot> = self
            .routing
            .load()
            .routes()
            .map(|r| r.stats.snapshot(r.task_id))
            .collect();

        let mut written = 0;
        for snapshot in &snapshots {
            match self.store.persist_stats_snapshot(snapshot).await {
                Ok(()) => written += 1,
                Err(e) => warn!(task_id = ?snapshot.task_id, error = %e, "Failed to persist statistics"),
            }
        }
        written
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Take the worker out of the map and routing, then drain it. `None`
    /// if no worker was running.
    async fn stop_worker(&self, task_id: i64) -> Option<Result<WorkerLifecycle, TaskError>> {
        let entry = {
            let mut workers = self.workers.write().await;
            let entry = workers.remove(&task_id)?;
            self.publish(&workers);
            entry
        };
        Some(entry.handle.drain().await)
    }

    fn publish(&self, workers: &HashMap<i64, WorkerEntry>) {
        let index = RoutingIndex::build(workers.values().map(|e| e.route.clone()));
        self.routing.store(Arc::new(index));
    }

    fn mark_inert(&self, task_id: i64, e: &TaskError) {
        let reason = match e {
            TaskError::ConfigurationInvalid { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        let mut inert = self.inert.lock().unwrap_or_else(PoisonError::into_inner);
        if inert.get(&task_id) != Some(&reason) {
            error!(task_id, reason = %reason, "Task configuration invalid, not started");
            inert.insert(task_id, reason);
        }
    }

    fn clear_inert(&self, task_id: i64) {
        self.inert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task_id);
    }

    fn record_drop(
        &self,
        route: &Route,
        message: &InboundMessage,
        reason: FailureReason,
        detail: &str,
    ) {
        route.stats.record(LogStatus::Dropped, Duration::ZERO);
        self.deps.recorder.record(
            ForwardingLogEntry::new(
                route.task_id,
                message.source_id,
                message.message_id,
                LogStatus::Dropped,
            )
            .reason(reason, detail),
        );
    }
}

impl std::fmt::Debug for ForwardingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("tasks", &self.routing.load().task_ids())
            .field("sinks", &self.deps.sinks)
            .finish()
    }
}

// ── Background loops ────────────────────────────────────────────────

/// Periodically diff the store against the running workers. A zero
/// interval disables the loop. Stops once the engine is dropped.
pub fn spawn_reload_ticker(engine: &Arc<ForwardingEngine>, interval: Duration) -> JoinHandle<()> {
    spawn_ticker(Arc::downgrade(engine), interval, "reload", |engine| async move {
        // Failures are already logged and leave the old config in place.
        let _ = engine.reload_from_store().await;
    })
}

/// Periodically persist statistics snapshots. A zero interval disables the
/// loop.
pub fn spawn_stats_flusher(engine: &Arc<ForwardingEngine>, interval: Duration) -> JoinHandle<()> {
    spawn_ticker(Arc::downgrade(engine), interval, "stats", |engine| async move {
        let written = engine.flush_statistics().await;
        debug!(written, "Statistics flushed");
    })
}

fn spawn_ticker<F, Fut>(
    engine: Weak<ForwardingEngine>,
    interval: Duration,
    name: &'static str,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut(Arc<ForwardingEngine>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if interval.is_zero() {
            debug!(ticker = name, "Ticker disabled");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(engine) = engine.upgrade() else {
                debug!(ticker = name, "Engine dropped, ticker stopping");
                return;
            };
            tick(engine).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::StdoutSink;
    use crate::store::MemoryStore;

    fn engine_with(store: Arc<MemoryStore>) -> ForwardingEngine {
        ForwardingEngine::new(
            EngineConfig::default(),
            store,
            Sinks::single(Arc::new(StdoutSink::new())),
            None,
        )
    }

    fn task(id: i64, source: i64) -> Task {
        Task::new(id, 1, format!("task-{id}"))
            .with_source(source)
            .with_target(-900 - id)
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        assert_eq!(
            engine.register_task(task(1, -10)).await.unwrap(),
            RegistrationOutcome::Started
        );
        assert_eq!(
            engine.register_task(task(1, -10)).await.unwrap(),
            RegistrationOutcome::Unchanged
        );
        assert_eq!(engine.task_ids(), vec![1]);
        assert_eq!(engine.worker_state(1).await, Some(WorkerState::Running));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn reload_moves_routes() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.register_task(task(1, -10)).await.unwrap();
        assert_eq!(
            engine.register_task(task(1, -20)).await.unwrap(),
            RegistrationOutcome::Reloaded
        );

        let msg = InboundMessage::text(-10, 1, "old source");
        assert_eq!(engine.dispatch(msg).matched, 0);
        let msg = InboundMessage::text(-20, 2, "new source");
        assert_eq!(engine.dispatch(msg).matched, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_task_is_inert_and_stops_worker() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        engine.register_task(task(1, -10)).await.unwrap();

        let broken = Task::new(1, 1, "no targets").with_source(-10);
        let err = engine.register_task(broken).await.unwrap_err();
        assert!(matches!(err, TaskError::ConfigurationInvalid { task_id: 1, .. }));
        assert!(engine.task_ids().is_empty());
        assert!(engine.inert_tasks().contains_key(&1));

        // Fixing it clears the inert mark.
        engine.register_task(task(1, -10)).await.unwrap();
        assert!(engine.inert_tasks().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn inactive_task_is_not_started() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        let mut off = task(1, -10);
        off.active = false;
        assert_eq!(
            engine.register_task(off).await.unwrap(),
            RegistrationOutcome::Inactive
        );
        assert!(engine.task_ids().is_empty());
    }

    #[tokio::test]
    async fn unregister_unknown_task() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        assert!(matches!(
            engine.unregister_task(7).await,
            Err(TaskError::NotFound { task_id: 7 })
        ));
    }

    #[tokio::test]
    async fn statistics_global_and_per_task() {
        let engine = engine_with(Arc::new(MemoryStore::new()));
        assert!(engine.statistics(Some(1)).is_none());
        let global = engine.statistics(None).unwrap();
        assert_eq!(global.task_id, None);
        assert_eq!(global.seen, 0);

        engine.register_task(task(1, -10)).await.unwrap();
        assert_eq!(engine.statistics(Some(1)).unwrap().task_id, Some(1));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn set_task_active_round_trip() {
        let store = Arc::new(MemoryStore::with_tasks([task(1, -10)]).await);
        let engine = engine_with(store.clone());
        engine.load_from_store().await.unwrap();
        assert_eq!(engine.task_ids(), vec![1]);

        assert_eq!(
            engine.set_task_active(1, false).await.unwrap(),
            RegistrationOutcome::Inactive
        );
        assert!(engine.task_ids().is_empty());
        assert_eq!(
            engine.set_task_active(1, true).await.unwrap(),
            RegistrationOutcome::Started
        );
        assert_eq!(engine.task_ids(), vec![1]);

        store.delete_task(1).await.unwrap();
        assert_eq!(
            engine.reload_task(1).await.unwrap(),
            RegistrationOutcome::Removed
        );
        assert!(engine.task_ids().is_empty());
    }

    #[tokio::test]
    async fn shutdown_writes_final_stats() {
        let store = Arc::new(MemoryStore::with_tasks([task(1, -10), task(2, -10)]).await);
        let engine = engine_with(store.clone());
        engine.load_from_store().await.unwrap();

        let stopped = engine.shutdown().await;
        assert_eq!(stopped.len(), 2);
        assert!(stopped.iter().all(|l| l.state == WorkerState::Stopped));
        assert_eq!(store.snapshots().await.len(), 2);
        assert!(engine.task_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_flusher_ticks() {
        let store = Arc::new(MemoryStore::with_tasks([task(1, -10)]).await);
        let engine = Arc::new(engine_with(store.clone()));
        engine.load_from_store().await.unwrap();

        let flusher = spawn_stats_flusher(&engine, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.snapshots().await.len(), 1);
        flusher.abort();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn zero_interval_disables_ticker() {
        let engine = Arc::new(engine_with(Arc::new(MemoryStore::new())));
        let ticker = spawn_reload_ticker(&engine, Duration::ZERO);
        ticker.await.unwrap();
    }
}
