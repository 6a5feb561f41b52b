//! Per-task worker: consume, filter, transform, dedup, throttle, deliver.
//!
//! One tokio task per registered task. It owns the dedup cache, the sending
//! quota and the per-target buckets, so none of them need cross-worker
//! locking. First delivery attempts for a message run concurrently across
//! its targets; anything that has to wait (rate limit, transient failure,
//! configured delay) becomes a timer-driven continuation in a `JoinSet` and
//! the loop moves on to the next message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::{RwLock, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use crate::channels::{DeliveryResult, DeliverySink, Sinks, Translator};
use crate::config::EngineConfig;
use crate::dedup::{DeduplicationCache, fingerprint};
use crate::error::TaskError;
use crate::pipeline::types::{DeliveryOptions, InboundMessage, OutboundMessage};
use crate::pipeline::{MessagePipeline, Processed};
use crate::ratelimit::{Acquire, SendingQuota, TokenBucket};
use crate::task::{RateLimitConfig, Task};
use crate::worker::recorder::{FailureReason, ForwardingLogEntry, LogRecorder, LogStatus};
use crate::worker::retry::RetryPolicy;
use crate::worker::state::{WorkerLifecycle, WorkerState};
use crate::worker::stats::TaskStatistics;

/// A validated task with its compiled pipeline and resolved limits.
#[derive(Debug, Clone)]
pub struct TaskRuntime {
    pub task: Arc<Task>,
    pub pipeline: Arc<MessagePipeline>,
    pub retry: RetryPolicy,
    pub dedup_capacity: usize,
    pub dedup_retention: Duration,
}

impl TaskRuntime {
    /// Validate the task and compile its pipeline. Engine defaults fill in
    /// whatever the task's limits leave unset.
    pub fn compile(
        task: Task,
        config: &EngineConfig,
        translator: Option<Arc<dyn Translator>>,
    ) -> Result<Self, TaskError> {
        task.validate()?;
        let pipeline = MessagePipeline::build(&task, translator)
            .map_err(|e| TaskError::ConfigurationInvalid {
                task_id: task.id,
                reason: e.to_string(),
            })?
            .with_translate_timeout(config.delivery_timeout);

        let limits = &task.limits;
        let retry = limits.retry.unwrap_or(config.retry);
        let dedup_capacity = limits.dedup_capacity.unwrap_or(config.dedup_capacity);
        let dedup_retention = limits
            .dedup_retention_secs
            .map(Duration::from_secs)
            .unwrap_or(config.dedup_retention);

        Ok(Self {
            task: Arc::new(task),
            pipeline: Arc::new(pipeline),
            retry,
            dedup_capacity,
            dedup_retention,
        })
    }

    pub fn task_id(&self) -> i64 {
        self.task.id
    }
}

/// Shared dependencies for worker execution.
#[derive(Clone, Debug)]
pub struct WorkerDeps {
    pub sinks: Sinks,
    pub recorder: LogRecorder,
    pub queue_capacity: usize,
    pub drain_timeout: Duration,
    pub delivery_timeout: Duration,
}

impl WorkerDeps {
    pub fn new(sinks: Sinks, recorder: LogRecorder, config: &EngineConfig) -> Self {
        Self {
            sinks,
            recorder,
            queue_capacity: config.queue_capacity,
            drain_timeout: config.drain_timeout,
            delivery_timeout: config.delivery_timeout,
        }
    }
}

/// Control messages from the engine. Processed ahead of queued events.
#[derive(Debug)]
pub enum WorkerCommand {
    Reload(Box<TaskRuntime>),
    Drain,
}

/// Engine-side handle to a running worker.
pub struct WorkerHandle {
    task_id: i64,
    tx: mpsc::Sender<InboundMessage>,
    control: mpsc::Sender<WorkerCommand>,
    join: JoinHandle<()>,
    lifecycle: Arc<RwLock<WorkerLifecycle>>,
    stats: Arc<TaskStatistics>,
    stop_limit: Duration,
}

impl WorkerHandle {
    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// Inbound queue sender. Dispatch uses `try_send` on it.
    pub fn sender(&self) -> mpsc::Sender<InboundMessage> {
        self.tx.clone()
    }

    pub fn stats(&self) -> Arc<TaskStatistics> {
        self.stats.clone()
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.read().await.state
    }

    pub async fn lifecycle(&self) -> WorkerLifecycle {
        self.lifecycle.read().await.clone()
    }

    /// Swap in a new configuration without losing queued events, dedup
    /// history or statistics.
    pub async fn reload(&self, runtime: TaskRuntime) -> Result<(), TaskError> {
        self.control
            .send(WorkerCommand::Reload(Box::new(runtime)))
            .await
            .map_err(|_| TaskError::NotFound {
                task_id: self.task_id,
            })
    }

    /// Stop the worker: close its queue, let queued events finish, give
    /// pending retries the drain timeout, then cancel what is left.
    pub async fn drain(self) -> Result<WorkerLifecycle, TaskError> {
        let Self {
            task_id,
            tx,
            control,
            mut join,
            lifecycle,
            stop_limit,
            ..
        } = self;
        drop(tx);

        // The worker may already have stopped on its own.
        let _ = control.send(WorkerCommand::Drain).await;

        match timeout(stop_limit, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task_id, error = %e, "Worker task ended abnormally"),
            Err(_) => {
                join.abort();
                // The worker logs what it still owed when its future is dropped.
                let _ = join.await;
                let state = lifecycle.read().await.state;
                error!(task_id, state = %state, "Worker did not stop in time, aborted");
                return Err(TaskError::DrainTimeout {
                    task_id,
                    timeout: stop_limit,
                });
            }
        }

        Ok(lifecycle.read().await.clone())
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("task_id", &self.task_id)
            .field("queued", &(self.tx.max_capacity() - self.tx.capacity()))
            .finish()
    }
}

/// Worker that runs a single task.
pub struct TaskWorker {
    task_id: i64,
    runtime: TaskRuntime,
    rx: mpsc::Receiver<InboundMessage>,
    control: mpsc::Receiver<WorkerCommand>,
    sinks: Sinks,
    delivery: Arc<Delivery>,
    dedup: DeduplicationCache,
    quota: SendingQuota,
    gate: Arc<TargetGate>,
    lanes: HashMap<i64, mpsc::Sender<LaneItem>>,
    lane_capacity: usize,
    continuations: JoinSet<()>,
    lifecycle: Arc<RwLock<WorkerLifecycle>>,
    drain_timeout: Duration,
    /// Message currently inside `handle`, if any.
    in_flight: Option<InboundMessage>,
}

impl TaskWorker {
    /// Start a worker on the current runtime.
    pub fn spawn(runtime: TaskRuntime, deps: WorkerDeps) -> WorkerHandle {
        let task_id = runtime.task_id();
        let (tx, rx) = mpsc::channel(deps.queue_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(8);
        let stats = Arc::new(TaskStatistics::new());

        // Running from registration on, before the runtime first polls the worker.
        let mut initial = WorkerLifecycle::new(task_id);
        if let Err(e) = initial.transition_to(WorkerState::Running, Some("registered".to_string())) {
            warn!(task_id, error = %e, "Ignoring worker transition");
        }
        let lifecycle = Arc::new(RwLock::new(initial));

        let delivery = Arc::new(Delivery {
            task_id,
            recorder: deps.recorder.clone(),
            stats: stats.clone(),
            delivery_timeout: deps.delivery_timeout,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        let quota = SendingQuota::new(runtime.task.limits.quota);
        let gate = Arc::new(TargetGate::new(runtime.task.limits.rate));
        let worker = Self {
            task_id,
            dedup: DeduplicationCache::new(runtime.dedup_capacity, runtime.dedup_retention),
            quota,
            gate,
            runtime,
            rx,
            control: control_rx,
            sinks: deps.sinks.clone(),
            delivery,
            lanes: HashMap::new(),
            lane_capacity: deps.queue_capacity.max(1),
            continuations: JoinSet::new(),
            lifecycle: lifecycle.clone(),
            drain_timeout: deps.drain_timeout,
            in_flight: None,
        };

        let join = tokio::spawn(worker.run());

        WorkerHandle {
            task_id,
            tx,
            control: control_tx,
            join,
            lifecycle,
            stats,
            stop_limit: deps.drain_timeout + deps.delivery_timeout + Duration::from_secs(1),
        }
    }

    async fn run(mut self) {
        info!(
            task_id = self.task_id,
            task = %self.runtime.task.name,
            targets = self.runtime.task.active_targets().count(),
            "Worker started"
        );

        loop {
            tokio::select! {
                biased;

                command = self.control.recv() => match command {
                    Some(WorkerCommand::Reload(runtime)) => self.reload(*runtime).await,
                    Some(WorkerCommand::Drain) | None => break,
                },

                Some(joined) = self.continuations.join_next(), if !self.continuations.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(task_id = self.task_id, error = %e, "Delivery continuation panicked");
                        }
                    }
                }

                message = self.rx.recv() => match message {
                    Some(message) => self.process(message).await,
                    None => break,
                },
            }
        }

        self.drain().await;
    }

    async fn process(&mut self, message: InboundMessage) {
        self.in_flight = Some(message.clone());
        self.handle(&message).await;
        self.in_flight = None;
    }

    /// Log the message `handle` was cut off on, unless its deliveries are
    /// already pending and will be accounted for per target.
    fn abandon_in_flight(&mut self, detail: &str) {
        let Some(message) = self.in_flight.take() else {
            return;
        };
        if self.delivery.has_pending(&message) {
            return;
        }
        self.delivery.record_message(
            &message,
            LogStatus::Dropped,
            FailureReason::Cancelled,
            detail.to_string(),
            Instant::now(),
        );
    }

    async fn handle(&mut self, message: &InboundMessage) {
        let started = Instant::now();
        self.delivery.stats.record_seen();

        let runtime = self.runtime.clone();
        let task = &runtime.task;

        let out = match runtime.pipeline.process(message, Utc::now()).await {
            Processed::Filtered { filter, reason } => {
                self.delivery.record_message(
                    message,
                    LogStatus::Filtered,
                    FailureReason::Filtered,
                    format!("{filter}: {reason}"),
                    started,
                );
                return;
            }
            Processed::Empty => {
                self.delivery.record_message(
                    message,
                    LogStatus::Filtered,
                    FailureReason::Filtered,
                    "nothing left to send after transforms".to_string(),
                    started,
                );
                return;
            }
            Processed::Ready(out) => out,
        };

        if task.filters.duplicates {
            let fp = fingerprint(task.limits.dedup_scope, &out);
            if self.dedup.check_and_insert(&fp, Instant::now()) {
                debug!(
                    task_id = self.task_id,
                    source = message.source_id,
                    message_id = message.message_id,
                    "Duplicate message"
                );
                self.delivery.record_message(
                    message,
                    LogStatus::Duplicate,
                    FailureReason::Duplicate,
                    "seen within the retention window".to_string(),
                    started,
                );
                return;
            }
        }

        if let Err(window) = self.quota.try_reserve(Instant::now()) {
            warn!(task_id = self.task_id, window = %window, "Sending quota exhausted");
            for target in task.active_targets() {
                self.delivery.record_target(
                    message,
                    target.chat_id,
                    FailureReason::QuotaExceeded,
                    format!("{window} quota exhausted"),
                    started,
                );
            }
            return;
        }

        let out = Arc::new(out);
        let sink = self.sinks.for_mode(task.mode);
        let not_before = task
            .limits
            .delay_range()
            .map(|(min, max)| Instant::now() + random_delay(min, max));

        let jobs: Vec<DeliveryJob> = task
            .active_targets()
            .map(|target| {
                self.delivery.job(
                    out.clone(),
                    target.chat_id,
                    target.options(task.mode),
                    runtime.retry,
                    sink.clone(),
                    self.gate.clone(),
                    started,
                )
            })
            .collect();

        if runtime.retry.is_ordered() {
            for job in jobs {
                self.enqueue_lane(job, not_before).await;
            }
            return;
        }

        if let Some(at) = not_before {
            for job in jobs {
                self.continuations
                    .spawn(run_job(self.delivery.clone(), job, Some(at)));
            }
            return;
        }

        let delivery = &self.delivery;
        let steps = join_all(jobs.into_iter().map(|mut job| async move {
            let step = delivery.attempt(&mut job).await;
            (job, step)
        }))
        .await;

        for (job, step) in steps {
            if let Step::Retry(delay) = step {
                let at = Instant::now() + delay;
                self.continuations
                    .spawn(run_job(self.delivery.clone(), job, Some(at)));
            }
        }
    }

    /// Strict ordering: every delivery for a target goes through that
    /// target's lane, so a later message waits for an earlier one's retries.
    async fn enqueue_lane(&mut self, job: DeliveryJob, not_before: Option<Instant>) {
        let target_id = job.target_id;
        if !self.lanes.contains_key(&target_id) {
            let (tx, rx) = mpsc::channel(self.lane_capacity);
            self.continuations
                .spawn(run_lane(self.delivery.clone(), rx));
            self.lanes.insert(target_id, tx);
        }
        let Some(lane) = self.lanes.get(&target_id).cloned() else {
            return;
        };

        if let Err(mpsc::error::SendError(item)) = lane.send(LaneItem { job, not_before }).await {
            self.delivery.finish(
                &item.job,
                Err((FailureReason::Cancelled, "delivery lane closed".to_string())),
            );
        }
    }

    async fn reload(&mut self, runtime: TaskRuntime) {
        let old = &self.runtime;
        let (old_limits, new_limits) = (&old.task.limits, &runtime.task.limits);

        if old_limits.rate != new_limits.rate {
            self.gate = Arc::new(TargetGate::new(new_limits.rate));
        }
        if old.dedup_capacity != runtime.dedup_capacity
            || old.dedup_retention != runtime.dedup_retention
        {
            self.dedup = DeduplicationCache::new(runtime.dedup_capacity, runtime.dedup_retention);
        }
        if old_limits.quota != new_limits.quota {
            self.quota = SendingQuota::new(new_limits.quota);
        }
        if old.retry.ordering != runtime.retry.ordering {
            // Lanes finish what they hold, then exit.
            self.lanes.clear();
        }

        self.runtime = runtime;
        self.lifecycle.write().await.reloads += 1;
        info!(
            task_id = self.task_id,
            task = %self.runtime.task.name,
            "Worker reloaded"
        );
    }

    async fn drain(&mut self) {
        self.transition(WorkerState::Draining, "drain requested").await;
        self.rx.close();
        let deadline = Instant::now() + self.drain_timeout;

        while let Some(message) = self.rx.recv().await {
            if Instant::now() >= deadline {
                self.delivery.record_message(
                    &message,
                    LogStatus::Dropped,
                    FailureReason::Cancelled,
                    "worker stopped before processing".to_string(),
                    Instant::now(),
                );
                continue;
            }
            let message_id = message.message_id;
            if timeout_at(deadline, self.process(message)).await.is_err() {
                warn!(
                    task_id = self.task_id,
                    message_id,
                    "Drain timeout while processing queued message"
                );
                self.abandon_in_flight("drain deadline reached while processing");
            }
        }

        self.lanes.clear();
        let continuations = &mut self.continuations;
        let finished = timeout_at(deadline, async move {
            while continuations.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                task_id = self.task_id,
                pending = self.continuations.len(),
                "Drain timeout, cancelling pending deliveries"
            );
            self.continuations.abort_all();
            while self.continuations.join_next().await.is_some() {}
        }

        let cancelled = self.delivery.cancel_pending();
        self.transition(WorkerState::Stopped, "drained").await;
        info!(task_id = self.task_id, cancelled, "Worker stopped");
    }

    async fn transition(&self, state: WorkerState, reason: &str) {
        let mut lifecycle = self.lifecycle.write().await;
        if let Err(e) = lifecycle.transition_to(state, Some(reason.to_string())) {
            warn!(task_id = self.task_id, error = %e, "Ignoring worker transition");
        }
    }
}

/// Runs when the worker future is dropped without finishing its drain,
/// i.e. after the handle aborted it. Everything still owed gets logged.
impl Drop for TaskWorker {
    fn drop(&mut self) {
        let shared = self.lifecycle.clone();
        let Ok(mut lifecycle) = shared.try_write() else {
            warn!(task_id = self.task_id, "Lifecycle busy, skipping abort cleanup");
            return;
        };
        if lifecycle.state.is_terminal() {
            return;
        }

        self.continuations.abort_all();
        self.abandon_in_flight("worker aborted while processing");

        self.rx.close();
        let mut dropped = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.delivery.record_message(
                &message,
                LogStatus::Dropped,
                FailureReason::Cancelled,
                "worker aborted before processing".to_string(),
                Instant::now(),
            );
            dropped += 1;
        }
        let cancelled = self.delivery.cancel_pending();

        if lifecycle.state == WorkerState::Running {
            let _ = lifecycle.transition_to(WorkerState::Draining, Some("aborted".to_string()));
        }
        if let Err(e) = lifecycle.transition_to(WorkerState::Stopped, Some("aborted".to_string())) {
            warn!(task_id = self.task_id, error = %e, "Ignoring worker transition");
        }
        warn!(task_id = self.task_id, dropped, cancelled, "Worker aborted");
    }
}

fn random_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

// ── Delivery ────────────────────────────────────────────────────────

/// Lazily created token bucket per target.
#[derive(Debug)]
struct TargetGate {
    rate: Option<RateLimitConfig>,
    buckets: Mutex<HashMap<i64, TokenBucket>>,
}

impl TargetGate {
    fn new(rate: Option<RateLimitConfig>) -> Self {
        Self {
            rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn try_acquire(&self, target_id: i64, now: Instant) -> Acquire {
        let Some(rate) = self.rate else {
            return Acquire::Granted;
        };
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(target_id)
            .or_insert_with(|| TokenBucket::new(rate.capacity, rate.refill_per_sec, now))
            .try_acquire(now)
    }
}

struct DeliveryJob {
    id: u64,
    target_id: i64,
    message: Arc<OutboundMessage>,
    options: DeliveryOptions,
    policy: RetryPolicy,
    sink: Arc<dyn DeliverySink>,
    gate: Arc<TargetGate>,
    attempts: u32,
}

struct LaneItem {
    job: DeliveryJob,
    not_before: Option<Instant>,
}

/// What the worker still owes a log entry for.
#[derive(Debug)]
struct PendingDelivery {
    source_id: i64,
    message_id: i64,
    target_id: i64,
    attempts: u32,
    started: Instant,
}

enum Step {
    Done,
    Retry(Duration),
}

/// State shared between the worker loop and its continuations.
struct Delivery {
    task_id: i64,
    recorder: LogRecorder,
    stats: Arc<TaskStatistics>,
    delivery_timeout: Duration,
    pending: Mutex<HashMap<u64, PendingDelivery>>,
    next_id: AtomicU64,
}

impl Delivery {
    /// Create a job and register it as owing exactly one terminal log entry.
    #[allow(clippy::too_many_arguments)]
    fn job(
        &self,
        message: Arc<OutboundMessage>,
        target_id: i64,
        options: DeliveryOptions,
        policy: RetryPolicy,
        sink: Arc<dyn DeliverySink>,
        gate: Arc<TargetGate>,
        started: Instant,
    ) -> DeliveryJob {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending_map().insert(
            id,
            PendingDelivery {
                source_id: message.source_id,
                message_id: message.source_message_id,
                target_id,
                attempts: 0,
                started,
            },
        );
        DeliveryJob {
            id,
            target_id,
            message,
            options,
            policy,
            sink,
            gate,
            attempts: 0,
        }
    }

    /// One attempt: take a token, call the sink, classify the outcome.
    async fn attempt(&self, job: &mut DeliveryJob) -> Step {
        job.attempts += 1;
        self.note_attempt(job);

        if let Acquire::Denied { retry_after } = job.gate.try_acquire(job.target_id, Instant::now()) {
            return match job.policy.next_delay(job.attempts, Some(retry_after)) {
                Some(delay) => {
                    debug!(
                        task_id = self.task_id,
                        target = job.target_id,
                        attempt = job.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, deferring"
                    );
                    Step::Retry(delay)
                }
                None => {
                    self.finish(
                        job,
                        Err((
                            FailureReason::RateLimited,
                            format!("rate limited after {} attempts", job.attempts),
                        )),
                    );
                    Step::Done
                }
            };
        }

        let result = timeout(
            self.delivery_timeout,
            job.sink.deliver(job.target_id, &job.message, &job.options),
        )
        .await;

        let (reason, retry_after) = match result {
            Ok(Ok(DeliveryResult::Delivered { message_id })) => {
                self.finish(job, Ok(message_id));
                return Step::Done;
            }
            Ok(Ok(DeliveryResult::Permanent { reason })) => {
                self.finish(job, Err((FailureReason::Permanent, reason)));
                return Step::Done;
            }
            Ok(Err(e)) => {
                self.finish(job, Err((FailureReason::Permanent, e.to_string())));
                return Step::Done;
            }
            Ok(Ok(DeliveryResult::Transient {
                reason,
                retry_after,
            })) => (reason, retry_after),
            Err(_) => (
                format!("{} did not answer within {:?}", job.sink.name(), self.delivery_timeout),
                None,
            ),
        };

        match job.policy.next_delay(job.attempts, retry_after) {
            Some(delay) => {
                debug!(
                    task_id = self.task_id,
                    target = job.target_id,
                    attempt = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Transient delivery failure, retrying"
                );
                Step::Retry(delay)
            }
            None => {
                self.finish(job, Err((FailureReason::Transient, reason)));
                Step::Done
            }
        }
    }

    /// Record the terminal outcome, once. A job already cancelled is ignored.
    fn finish(&self, job: &DeliveryJob, outcome: Result<i64, (FailureReason, String)>) {
        let Some(pending) = self.pending_map().remove(&job.id) else {
            return;
        };
        let latency = pending.started.elapsed();
        let entry = ForwardingLogEntry::new(
            self.task_id,
            pending.source_id,
            pending.message_id,
            LogStatus::Success,
        )
        .target(job.target_id)
        .attempts(job.attempts)
        .latency(latency);

        let entry = match outcome {
            Ok(forwarded_id) => {
                debug!(
                    task_id = self.task_id,
                    target = job.target_id,
                    status = "success",
                    latency_ms = latency.as_millis() as u64,
                    "Delivered"
                );
                entry.forwarded_as(forwarded_id)
            }
            Err((reason, detail)) => {
                if reason == FailureReason::Permanent {
                    error!(
                        task_id = self.task_id,
                        target = job.target_id,
                        status = "failed",
                        reason = %reason,
                        detail = %detail,
                        "Delivery failed"
                    );
                } else {
                    warn!(
                        task_id = self.task_id,
                        target = job.target_id,
                        status = "failed",
                        reason = %reason,
                        attempts = job.attempts,
                        detail = %detail,
                        "Delivery gave up"
                    );
                }
                ForwardingLogEntry {
                    status: LogStatus::Failed,
                    ..entry
                }
                .reason(reason, detail)
            }
        };

        self.stats.record(entry.status, latency);
        self.recorder.record(entry);
    }

    /// Log every still-pending delivery as cancelled. Returns how many.
    fn cancel_pending(&self) -> usize {
        let drained: Vec<PendingDelivery> = self.pending_map().drain().map(|(_, p)| p).collect();
        for pending in &drained {
            let latency = pending.started.elapsed();
            self.stats.record(LogStatus::Failed, latency);
            self.recorder.record(
                ForwardingLogEntry::new(
                    self.task_id,
                    pending.source_id,
                    pending.message_id,
                    LogStatus::Failed,
                )
                .target(pending.target_id)
                .reason(FailureReason::Cancelled, "worker stopped before delivery completed")
                .attempts(pending.attempts)
                .latency(latency),
            );
        }
        drained.len()
    }

    /// One per-message outcome (filtered, duplicate, dropped).
    fn record_message(
        &self,
        message: &InboundMessage,
        status: LogStatus,
        reason: FailureReason,
        detail: String,
        started: Instant,
    ) {
        let latency = started.elapsed();
        self.stats.record(status, latency);
        self.recorder.record(
            ForwardingLogEntry::new(self.task_id, message.source_id, message.message_id, status)
                .reason(reason, detail)
                .latency(latency),
        );
    }

    /// A per-target failure decided before any delivery job exists.
    fn record_target(
        &self,
        message: &InboundMessage,
        target_id: i64,
        reason: FailureReason,
        detail: String,
        started: Instant,
    ) {
        let latency = started.elapsed();
        self.stats.record(LogStatus::Failed, latency);
        self.recorder.record(
            ForwardingLogEntry::new(
                self.task_id,
                message.source_id,
                message.message_id,
                LogStatus::Failed,
            )
            .target(target_id)
            .reason(reason, detail)
            .latency(latency),
        );
    }

    /// Whether any delivery for this message is still owed a log entry.
    fn has_pending(&self, message: &InboundMessage) -> bool {
        self.pending_map()
            .values()
            .any(|p| p.source_id == message.source_id && p.message_id == message.message_id)
    }

    fn note_attempt(&self, job: &DeliveryJob) {
        if let Some(pending) = self.pending_map().get_mut(&job.id) {
            pending.attempts = job.attempts;
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingDelivery>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Retry continuation: wait, attempt, repeat until a terminal outcome.
async fn run_job(delivery: Arc<Delivery>, mut job: DeliveryJob, not_before: Option<Instant>) {
    if let Some(at) = not_before {
        sleep_until(at).await;
    }
    loop {
        match delivery.attempt(&mut job).await {
            Step::Done => return,
            Step::Retry(delay) => sleep_until(Instant::now() + delay).await,
        }
    }
}

async fn run_lane(delivery: Arc<Delivery>, mut rx: mpsc::Receiver<LaneItem>) {
    while let Some(item) = rx.recv().await {
        run_job(delivery.clone(), item.job, item.not_before).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::error::{DeliveryError, PipelineError};
    use crate::pipeline::filters::KeywordConfig;
    use crate::pipeline::transforms::ReplacementRule;
    use crate::store::MemoryStore;
    use crate::worker::retry::OrderingPolicy;

    /// Sink that plays back scripted results, then succeeds.
    struct ScriptedSink {
        script: Mutex<Vec<DeliveryResult>>,
        calls: AtomicUsize,
        delivered: Mutex<Vec<(i64, String)>>,
    }

    impl ScriptedSink {
        fn new(script: Vec<DeliveryResult>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn delivered(&self) -> Vec<(i64, String)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliverySink for ScriptedSink {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn deliver(
            &self,
            target_id: i64,
            message: &OutboundMessage,
            _options: &DeliveryOptions,
        ) -> Result<DeliveryResult, DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() { None } else { Some(script.remove(0)) }
            };
            match next {
                Some(result) => Ok(result),
                None => {
                    self.delivered
                        .lock()
                        .unwrap()
                        .push((target_id, message.body().to_string()));
                    Ok(DeliveryResult::Delivered {
                        message_id: n as i64 + 1,
                    })
                }
            }
        }
    }

    /// Sink that never answers.
    struct StalledSink;

    #[async_trait]
    impl DeliverySink for StalledSink {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn deliver(
            &self,
            _target_id: i64,
            _message: &OutboundMessage,
            _options: &DeliveryOptions,
        ) -> Result<DeliveryResult, DeliveryError> {
            std::future::pending().await
        }
    }

    struct StalledTranslator;

    #[async_trait]
    impl Translator for StalledTranslator {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn translate(&self, _text: &str, _target: &str) -> Result<String, PipelineError> {
            std::future::pending().await
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            drain_timeout: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(2),
            ..EngineConfig::default()
        }
    }

    fn start(
        task: Task,
        sink: Arc<ScriptedSink>,
    ) -> (WorkerHandle, broadcast::Receiver<ForwardingLogEntry>) {
        start_with(task, sink, config(), None)
    }

    fn start_with(
        task: Task,
        sink: Arc<dyn DeliverySink>,
        config: EngineConfig,
        translator: Option<Arc<dyn Translator>>,
    ) -> (WorkerHandle, broadcast::Receiver<ForwardingLogEntry>) {
        let store = Arc::new(MemoryStore::new());
        let (recorder, _writer) = LogRecorder::spawn(store, 64);
        let feed = recorder.subscribe();
        let runtime = TaskRuntime::compile(task, &config, translator).unwrap();
        let deps = WorkerDeps::new(Sinks::single(sink), recorder, &config);
        (TaskWorker::spawn(runtime, deps), feed)
    }

    fn translating_task() -> Task {
        let mut task = task();
        task.filters.duplicates = false;
        task.transforms.translate_to = Some("de".into());
        task
    }

    fn task() -> Task {
        Task::new(1, 42, "mirror").with_source(-100).with_target(-200)
    }

    #[tokio::test]
    async fn running_as_soon_as_spawned() {
        let (handle, _feed) = start(task(), ScriptedSink::new(vec![]));
        // Not yet polled by the runtime.
        assert_eq!(handle.state().await, WorkerState::Running);
        assert!(handle.lifecycle().await.started_at.is_some());
        handle.drain().await.unwrap();
    }

    #[tokio::test]
    async fn delivers_transformed_text() {
        let mut task = task();
        task.transforms.replacements = vec![ReplacementRule::literal("foo", "bar")];
        let sink = ScriptedSink::new(vec![]);
        let (handle, mut feed) = start(task, sink.clone());

        handle.sender().send(InboundMessage::text(-100, 1, "foo baz")).await.unwrap();
        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.status, LogStatus::Success);
        assert_eq!(entry.target_id, Some(-200));
        assert_eq!(entry.forwarded_message_id, Some(1));
        assert_eq!(sink.delivered(), vec![(-200, "bar baz".to_string())]);

        let stats = handle.stats().snapshot(1);
        assert_eq!(stats.seen, 1);
        assert_eq!(stats.forwarded, 1);
        handle.drain().await.unwrap();
    }

    #[tokio::test]
    async fn filtered_message_logs_once_without_target() {
        let mut task = task().with_target(-300);
        task.filters.keywords = KeywordConfig {
            deny: vec!["spam".into()],
            ..KeywordConfig::default()
        };
        let sink = ScriptedSink::new(vec![]);
        let (handle, mut feed) = start(task, sink.clone());

        handle.sender().send(InboundMessage::text(-100, 1, "hello spam")).await.unwrap();
        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.status, LogStatus::Filtered);
        assert_eq!(entry.target_id, None);
        assert_eq!(entry.reason, Some(FailureReason::Filtered));

        let stats = handle.stats();
        handle.drain().await.unwrap();
        assert_eq!(stats.snapshot(1).filtered, 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_copy_is_duplicate() {
        let sink = ScriptedSink::new(vec![]);
        let (handle, mut feed) = start(task(), sink.clone());

        handle.sender().send(InboundMessage::text(-100, 1, "same")).await.unwrap();
        handle.sender().send(InboundMessage::text(-100, 2, "same")).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().status, LogStatus::Success);
        let dup = feed.recv().await.unwrap();
        assert_eq!(dup.status, LogStatus::Duplicate);
        assert_eq!(dup.message_id, 2);
        handle.drain().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_with_backoff() {
        let sink = ScriptedSink::new(vec![
            DeliveryResult::transient("flood"),
            DeliveryResult::transient("flood"),
        ]);
        let (handle, mut feed) = start(task(), sink.clone());
        let t0 = Instant::now();

        handle.sender().send(InboundMessage::text(-100, 1, "hi")).await.unwrap();
        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.status, LogStatus::Success);
        assert_eq!(entry.attempts, 3);
        // 1s then 2s of backoff.
        assert!(t0.elapsed() >= Duration::from_secs(3));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        handle.drain().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_transient() {
        let mut task = task();
        task.limits.retry = Some(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });
        let sink = ScriptedSink::new(vec![
            DeliveryResult::transient("down"),
            DeliveryResult::transient("still down"),
        ]);
        let (handle, mut feed) = start(task, sink);

        handle.sender().send(InboundMessage::text(-100, 1, "hi")).await.unwrap();
        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.status, LogStatus::Failed);
        assert_eq!(entry.reason, Some(FailureReason::Transient));
        assert_eq!(entry.detail.as_deref(), Some("still down"));
        assert_eq!(entry.attempts, 2);
        handle.drain().await.unwrap();
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let sink = ScriptedSink::new(vec![DeliveryResult::permanent("chat not found")]);
        let (handle, mut feed) = start(task(), sink.clone());

        handle.sender().send(InboundMessage::text(-100, 1, "hi")).await.unwrap();
        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.status, LogStatus::Failed);
        assert_eq!(entry.reason, Some(FailureReason::Permanent));
        assert_eq!(entry.attempts, 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        handle.drain().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_message_is_deferred_not_dropped() {
        let mut task = task();
        task.limits.rate = Some(RateLimitConfig {
            capacity: 1,
            refill_per_sec: 0.1,
        });
        let sink = ScriptedSink::new(vec![]);
        let (handle, mut feed) = start(task, sink.clone());
        let t0 = Instant::now();

        handle.sender().send(InboundMessage::text(-100, 1, "first")).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().status, LogStatus::Success);

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.sender().send(InboundMessage::text(-100, 2, "second")).await.unwrap();
        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.status, LogStatus::Success);
        assert_eq!(entry.message_id, 2);
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "delivered at {elapsed:?}");
        assert!(elapsed < Duration::from_secs(11), "delivered at {elapsed:?}");
        handle.drain().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_cancels_retries_past_the_timeout() {
        let mut task = task();
        task.limits.retry = Some(RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
            ordering: OrderingPolicy::Relaxed,
        });
        let sink = ScriptedSink::new(vec![DeliveryResult::transient("busy")]);
        let (handle, mut feed) = start(task, sink);

        handle.sender().send(InboundMessage::text(-100, 1, "hi")).await.unwrap();
        // Let the first attempt run and schedule its continuation.
        while handle.stats().snapshot(1).seen == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lifecycle = handle.drain().await.unwrap();
        assert_eq!(lifecycle.state, WorkerState::Stopped);
        let entry = feed.recv().await.unwrap();
        assert_eq!(entry.status, LogStatus::Failed);
        assert_eq!(entry.reason, Some(FailureReason::Cancelled));
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_translator_keeps_original_text() {
        let sink = ScriptedSink::new(vec![]);
        let translator: Arc<dyn Translator> = Arc::new(StalledTranslator);
        let (handle, mut feed) = start_with(translating_task(), sink.clone(), config(), Some(translator));

        handle.sender().send(InboundMessage::text(-100, 1, "the news")).await.unwrap();
        handle.sender().send(InboundMessage::text(-100, 2, "more news")).await.unwrap();

        let lifecycle = handle.drain().await.unwrap();
        assert_eq!(lifecycle.state, WorkerState::Stopped);
        for id in [1, 2] {
            let entry = feed.recv().await.unwrap();
            assert_eq!((entry.message_id, entry.status), (id, LogStatus::Success));
        }
        assert_eq!(
            sink.delivered(),
            vec![(-200, "the news".to_string()), (-200, "more news".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drain_deadline_logs_every_queued_message() {
        let config = EngineConfig {
            drain_timeout: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let sink = ScriptedSink::new(vec![]);
        let translator: Arc<dyn Translator> = Arc::new(StalledTranslator);
        let (handle, mut feed) = start_with(translating_task(), sink.clone(), config, Some(translator));

        handle.sender().send(InboundMessage::text(-100, 1, "the news")).await.unwrap();
        handle.sender().send(InboundMessage::text(-100, 2, "more news")).await.unwrap();
        let stats = handle.stats();

        let lifecycle = handle.drain().await.unwrap();
        assert_eq!(lifecycle.state, WorkerState::Stopped);

        // The first is cut off mid-translation, the second never starts.
        let first = feed.recv().await.unwrap();
        assert_eq!((first.message_id, first.status), (1, LogStatus::Dropped));
        assert_eq!(first.reason, Some(FailureReason::Cancelled));
        let second = feed.recv().await.unwrap();
        assert_eq!((second.message_id, second.status), (2, LogStatus::Dropped));

        let snapshot = stats.snapshot(1);
        assert_eq!(snapshot.dropped, 2);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_worker_logs_what_it_owed() {
        let config = EngineConfig {
            drain_timeout: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let translator: Arc<dyn Translator> = Arc::new(StalledTranslator);
        let (handle, mut feed) =
            start_with(translating_task(), Arc::new(StalledSink), config, Some(translator));
        let stats = handle.stats();

        handle.sender().send(InboundMessage::text(-100, 1, "the news")).await.unwrap();
        while stats.snapshot(1).seen == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.sender().send(InboundMessage::text(-100, 2, "more news")).await.unwrap();

        // Translation and delivery each take the full 5s, past the 7s stop limit.
        let err = handle.drain().await.unwrap_err();
        assert!(matches!(err, TaskError::DrainTimeout { task_id: 1, .. }));

        let mut entries = vec![feed.recv().await.unwrap(), feed.recv().await.unwrap()];
        entries.sort_by_key(|e| e.message_id);
        assert_eq!(entries[0].status, LogStatus::Failed);
        assert_eq!(entries[0].target_id, Some(-200));
        assert_eq!(entries[0].reason, Some(FailureReason::Cancelled));
        assert_eq!(entries[1].status, LogStatus::Dropped);
        assert_eq!(entries[1].target_id, None);
        assert!(feed.try_recv().is_err());

        let snapshot = stats.snapshot(1);
        assert_eq!((snapshot.failed, snapshot.dropped), (1, 1));
    }

    #[tokio::test]
    async fn per_target_ordering_delivers_in_order() {
        let mut task = task();
        task.filters.duplicates = false;
        task.limits.retry = Some(RetryPolicy {
            base_delay: Duration::from_millis(20),
            ordering: OrderingPolicy::PerTarget,
            ..RetryPolicy::default()
        });
        let sink = ScriptedSink::new(vec![DeliveryResult::transient("slow")]);
        let (handle, mut feed) = start(task, sink.clone());

        handle.sender().send(InboundMessage::text(-100, 1, "one")).await.unwrap();
        handle.sender().send(InboundMessage::text(-100, 2, "two")).await.unwrap();
        let first = feed.recv().await.unwrap();
        let second = feed.recv().await.unwrap();
        assert_eq!((first.message_id, second.message_id), (1, 2));
        assert_eq!(
            sink.delivered(),
            vec![(-200, "one".to_string()), (-200, "two".to_string())]
        );
        handle.drain().await.unwrap();
    }

    #[tokio::test]
    async fn hot_reload_applies_new_rules() {
        let sink = ScriptedSink::new(vec![]);
        let original = task();
        let (handle, mut feed) = start(original.clone(), sink.clone());

        let mut changed = original;
        changed.transforms.prefix = Some("[relay]".into());
        let runtime = TaskRuntime::compile(changed, &config(), None).unwrap();
        handle.reload(runtime).await.unwrap();

        handle.sender().send(InboundMessage::text(-100, 1, "news")).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().status, LogStatus::Success);
        assert_eq!(sink.delivered()[0].1, "[relay]\nnews");
        let lifecycle = handle.drain().await.unwrap();
        assert_eq!(lifecycle.reloads, 1);
    }

    #[tokio::test]
    async fn quota_exhaustion_fails_every_target() {
        let mut task = task().with_target(-300);
        task.filters.duplicates = false;
        task.limits.quota.per_minute = 1;
        let sink = ScriptedSink::new(vec![]);
        let (handle, mut feed) = start(task, sink);

        handle.sender().send(InboundMessage::text(-100, 1, "a")).await.unwrap();
        handle.sender().send(InboundMessage::text(-100, 2, "b")).await.unwrap();

        let mut quota_failures = 0;
        for _ in 0..4 {
            let entry = feed.recv().await.unwrap();
            if entry.reason == Some(FailureReason::QuotaExceeded) {
                assert_eq!(entry.message_id, 2);
                quota_failures += 1;
            }
        }
        assert_eq!(quota_failures, 2);
        handle.drain().await.unwrap();
    }

    #[test]
    fn compile_rejects_invalid_task() {
        let task = Task::new(9, 42, "broken").with_target(-200);
        let err = TaskRuntime::compile(task, &config(), None).unwrap_err();
        assert!(matches!(err, TaskError::ConfigurationInvalid { task_id: 9, .. }));
    }

    #[test]
    fn compile_resolves_engine_defaults() {
        let mut task = task();
        task.limits.dedup_capacity = Some(5);
        let runtime = TaskRuntime::compile(task, &config(), None).unwrap();
        assert_eq!(runtime.dedup_capacity, 5);
        assert_eq!(runtime.dedup_retention, Duration::from_secs(3600));
        assert_eq!(runtime.retry, RetryPolicy::default());
    }

    #[test]
    fn random_delay_stays_in_range() {
        for _ in 0..50 {
            let d = random_delay(Duration::from_secs(1), Duration::from_secs(3));
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(3));
        }
        assert_eq!(
            random_delay(Duration::from_secs(2), Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }
}
