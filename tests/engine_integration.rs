//! Integration tests for the forwarding engine.
//!
//! Drive the full engine (routing, workers, recorder) against the in-memory
//! store and scripted delivery sinks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};
use tokio::time::{Instant, timeout};

use relay_engine::channels::{DeliveryResult, DeliverySink, Sinks};
use relay_engine::config::EngineConfig;
use relay_engine::engine::{ForwardingEngine, RegistrationOutcome};
use relay_engine::error::DeliveryError;
use relay_engine::pipeline::filters::KeywordConfig;
use relay_engine::pipeline::transforms::ReplacementRule;
use relay_engine::pipeline::{DeliveryOptions, InboundMessage, MessagePayload, OutboundMessage};
use relay_engine::store::{ConfigStore, MemoryStore};
use relay_engine::task::{RateLimitConfig, Task, TaskMode};
use relay_engine::worker::{
    FailureReason, ForwardingLogEntry, LogStatus, OrderingPolicy, RetryPolicy, WorkerState,
};

// ── Sinks ───────────────────────────────────────────────────────────

/// Records every delivery and when it happened.
#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<(i64, String, Instant)>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn bodies(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body, _)| body.clone())
            .collect()
    }

    fn times(&self) -> Vec<Instant> {
        self.delivered.lock().unwrap().iter().map(|(_, _, t)| *t).collect()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(
        &self,
        target_id: i64,
        message: &OutboundMessage,
        _options: &DeliveryOptions,
    ) -> Result<DeliveryResult, DeliveryError> {
        let mut delivered = self.delivered.lock().unwrap();
        delivered.push((target_id, message.body().to_string(), Instant::now()));
        Ok(DeliveryResult::Delivered {
            message_id: delivered.len() as i64,
        })
    }
}

/// Always fails with a transient error.
#[derive(Default)]
struct FailingSink {
    calls: AtomicUsize,
}

#[async_trait]
impl DeliverySink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn deliver(
        &self,
        _target_id: i64,
        _message: &OutboundMessage,
        _options: &DeliveryOptions,
    ) -> Result<DeliveryResult, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DeliveryResult::Transient {
            reason: "upstream down".into(),
            retry_after: Some(Duration::from_secs(30)),
        })
    }
}

/// Blocks every delivery until released.
#[derive(Default)]
struct GatedSink {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl DeliverySink for GatedSink {
    fn name(&self) -> &str {
        "gated"
    }

    async fn deliver(
        &self,
        _target_id: i64,
        _message: &OutboundMessage,
        _options: &DeliveryOptions,
    ) -> Result<DeliveryResult, DeliveryError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(DeliveryResult::Delivered { message_id: 1 })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn config() -> EngineConfig {
    EngineConfig {
        drain_timeout: Duration::from_secs(2),
        delivery_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

fn engine(store: Arc<MemoryStore>, sinks: Sinks, config: EngineConfig) -> ForwardingEngine {
    ForwardingEngine::new(config, store, sinks, None)
}

fn task(id: i64) -> Task {
    Task::new(id, 7, format!("task-{id}"))
        .with_source(-100)
        .with_target(-200 - id)
}

async fn next_entry(feed: &mut broadcast::Receiver<ForwardingLogEntry>) -> ForwardingLogEntry {
    timeout(Duration::from_secs(120), feed.recv())
        .await
        .expect("log entry in time")
        .expect("log feed open")
}

/// Wait until a task has forwarded `n` messages.
async fn wait_forwarded(engine: &ForwardingEngine, task_id: i64, n: u64) {
    timeout(Duration::from_secs(10), async {
        while engine.statistics(Some(task_id)).map_or(0, |s| s.forwarded) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task caught up in time");
}

// ── Pipeline behaviour through the engine ───────────────────────────

#[tokio::test]
async fn keyword_deny_filters_and_counts() {
    let sink = RecordingSink::new();
    let engine = engine(
        Arc::new(MemoryStore::new()),
        Sinks::single(sink.clone()),
        config(),
    );
    let mut task = task(1);
    task.filters.keywords = KeywordConfig {
        deny: vec!["spam".into()],
        ..KeywordConfig::default()
    };
    engine.register_task(task).await.unwrap();
    let mut feed = engine.subscribe_logs();

    let report = engine.dispatch(InboundMessage::text(-100, 1, "hello spam"));
    assert_eq!(report.matched, 1);
    assert_eq!(report.enqueued, 1);

    let entry = next_entry(&mut feed).await;
    assert_eq!(entry.status, LogStatus::Filtered);
    assert_eq!(entry.target_id, None);

    let stats = engine.statistics(Some(1)).unwrap();
    assert_eq!(stats.filtered, 1);
    assert_eq!(stats.forwarded, 0);
    assert!(sink.bodies().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn replacement_rewrites_text() {
    let sink = RecordingSink::new();
    let engine = engine(
        Arc::new(MemoryStore::new()),
        Sinks::single(sink.clone()),
        config(),
    );
    let mut task = task(1);
    task.transforms.replacements = vec![ReplacementRule::literal("foo", "bar")];
    engine.register_task(task).await.unwrap();
    let mut feed = engine.subscribe_logs();

    engine.dispatch(InboundMessage::text(-100, 1, "foo baz"));
    assert_eq!(next_entry(&mut feed).await.status, LogStatus::Success);
    assert_eq!(sink.bodies(), vec!["bar baz".to_string()]);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn identical_messages_within_window_are_duplicates() {
    let sink = RecordingSink::new();
    let engine = engine(
        Arc::new(MemoryStore::new()),
        Sinks::single(sink.clone()),
        config(),
    );
    let mut task = task(1);
    task.limits.dedup_retention_secs = Some(60);
    engine.register_task(task).await.unwrap();
    let mut feed = engine.subscribe_logs();

    engine.dispatch(InboundMessage::text(-100, 1, "breaking news"));
    assert_eq!(next_entry(&mut feed).await.status, LogStatus::Success);

    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.dispatch(InboundMessage::text(-100, 2, "breaking news"));
    let entry = next_entry(&mut feed).await;
    assert_eq!(entry.status, LogStatus::Duplicate);
    assert_eq!(entry.reason, Some(FailureReason::Duplicate));

    assert_eq!(sink.bodies().len(), 1);
    assert_eq!(engine.statistics(Some(1)).unwrap().duplicate, 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn throttled_message_waits_for_a_token() {
    let sink = RecordingSink::new();
    let engine = engine(
        Arc::new(MemoryStore::new()),
        Sinks::single(sink.clone()),
        config(),
    );
    let mut task = task(1);
    task.limits.rate = Some(RateLimitConfig {
        capacity: 1,
        refill_per_sec: 0.1,
    });
    engine.register_task(task).await.unwrap();
    let mut feed = engine.subscribe_logs();
    let t0 = Instant::now();

    engine.dispatch(InboundMessage::text(-100, 1, "first"));
    assert_eq!(next_entry(&mut feed).await.status, LogStatus::Success);

    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.dispatch(InboundMessage::text(-100, 2, "second"));
    let entry = next_entry(&mut feed).await;
    assert_eq!(entry.status, LogStatus::Success);
    assert_eq!(entry.message_id, 2);
    assert!(entry.attempts >= 2);

    let times = sink.times();
    assert_eq!(times.len(), 2);
    assert!(times[0] - t0 < Duration::from_millis(100));
    let second = times[1] - t0;
    assert!(second >= Duration::from_secs(10), "second delivered at {second:?}");
    assert!(second < Duration::from_secs(11), "second delivered at {second:?}");
    engine.shutdown().await;
}

#[tokio::test]
async fn failing_task_does_not_delay_others() {
    let failing = Arc::new(FailingSink::default());
    let healthy = RecordingSink::new();
    let engine = engine(
        Arc::new(MemoryStore::new()),
        Sinks {
            bot: failing.clone(),
            account: healthy.clone(),
        },
        config(),
    );
    engine.register_task(task(1)).await.unwrap();
    let mut other = task(2);
    other.mode = TaskMode::Account;
    engine.register_task(other).await.unwrap();
    let mut feed = engine.subscribe_logs();

    let started = std::time::Instant::now();
    for id in 1..=3 {
        let report = engine.dispatch(InboundMessage::text(-100, id, format!("update {id}")));
        assert_eq!(report.matched, 2);
    }

    let mut delivered = 0;
    while delivered < 3 {
        let entry = next_entry(&mut feed).await;
        assert_eq!(entry.task_id, 2, "failing task must not reach a terminal outcome yet");
        assert_eq!(entry.status, LogStatus::Success);
        delivered += 1;
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(failing.calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(engine.statistics(Some(2)).unwrap().forwarded, 3);
    assert_eq!(engine.statistics(Some(1)).unwrap().forwarded, 0);

    // Pending retries of the failing task are cancelled, never silently lost.
    engine.unregister_task(1).await.unwrap();
    let mut cancelled = 0;
    while cancelled < 3 {
        let entry = next_entry(&mut feed).await;
        if entry.task_id == 1 {
            assert_eq!(entry.status, LogStatus::Failed);
            assert_eq!(entry.reason, Some(FailureReason::Cancelled));
            cancelled += 1;
        }
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn full_queue_drops_for_that_task_only() {
    let gated = Arc::new(GatedSink::default());
    let healthy = RecordingSink::new();
    let config = EngineConfig {
        queue_capacity: 1,
        ..config()
    };
    let engine = engine(
        Arc::new(MemoryStore::new()),
        Sinks {
            bot: gated.clone(),
            account: healthy.clone(),
        },
        config,
    );
    let mut stuck = task(1);
    stuck.filters.duplicates = false;
    engine.register_task(stuck).await.unwrap();
    let mut other = task(2);
    other.mode = TaskMode::Account;
    other.filters.duplicates = false;
    engine.register_task(other).await.unwrap();

    // First event occupies the stuck worker, second fills its queue. The
    // healthy task drains its own queue between dispatches.
    let report = engine.dispatch(InboundMessage::text(-100, 1, "one"));
    assert_eq!(report.dropped, 0);
    gated.entered.notified().await;
    wait_forwarded(&engine, 2, 1).await;
    let mut feed = engine.subscribe_logs();

    let report = engine.dispatch(InboundMessage::text(-100, 2, "two"));
    assert_eq!(report.dropped, 0);
    wait_forwarded(&engine, 2, 2).await;

    let report = engine.dispatch(InboundMessage::text(-100, 3, "three"));
    assert_eq!(report.matched, 2);
    assert_eq!(report.dropped, 1);
    wait_forwarded(&engine, 2, 3).await;
    assert_eq!(healthy.bodies(), vec!["one", "two", "three"]);

    let dropped = loop {
        let entry = next_entry(&mut feed).await;
        if entry.status == LogStatus::Dropped {
            break entry;
        }
    };
    assert_eq!(dropped.task_id, 1);
    assert_eq!(dropped.message_id, 3);
    assert_eq!(dropped.reason, Some(FailureReason::Backpressure));
    assert_eq!(engine.statistics(Some(1)).unwrap().dropped, 1);
    assert_eq!(engine.statistics(Some(2)).unwrap().dropped, 0);

    // Let the stuck worker finish both queued events.
    gated.release.notify_one();
    gated.entered.notified().await;
    gated.release.notify_one();
    engine.shutdown().await;
    assert_eq!(healthy.bodies().len(), 3);
}

#[tokio::test]
async fn on_message_assembles_event() {
    let sink = RecordingSink::new();
    let engine = engine(
        Arc::new(MemoryStore::new()),
        Sinks::single(sink.clone()),
        config(),
    );
    engine.register_task(task(1)).await.unwrap();
    let mut feed = engine.subscribe_logs();

    let payload = MessagePayload {
        message_id: 55,
        text: Some("from a listener".into()),
        ..MessagePayload::default()
    };
    let report = engine.on_message(-100, payload, serde_json::json!({"listener": "test"}));
    assert_eq!(report.enqueued, 1);

    let entry = next_entry(&mut feed).await;
    assert_eq!(entry.message_id, 55);
    assert_eq!(entry.status, LogStatus::Success);
    assert_eq!(sink.bodies(), vec!["from a listener".to_string()]);

    assert_eq!(engine.on_message(-999, MessagePayload::default(), serde_json::Value::Null).matched, 0);
    engine.shutdown().await;
}

// ── Configuration lifecycle ─────────────────────────────────────────

#[tokio::test]
async fn reload_from_store_applies_diff() {
    let store = Arc::new(MemoryStore::with_tasks([task(1), task(2)]).await);
    let sink = RecordingSink::new();
    let engine = engine(store.clone(), Sinks::single(sink.clone()), config());

    let report = engine.load_from_store().await.unwrap();
    assert_eq!(report.started, vec![1, 2]);

    let mut changed = task(1);
    changed.transforms.prefix = Some("[relay]".into());
    store.save_task(&changed).await.unwrap();
    store.delete_task(2).await.unwrap();
    store.save_task(&task(3)).await.unwrap();

    let report = engine.reload_from_store().await.unwrap();
    assert_eq!(report.started, vec![3]);
    assert_eq!(report.reloaded, vec![1]);
    assert_eq!(report.stopped, vec![2]);
    assert!(report.invalid.is_empty());
    assert_eq!(engine.task_ids(), vec![1, 3]);
    assert_eq!(engine.worker_state(2).await, None);

    let mut feed = engine.subscribe_logs();
    engine.dispatch(InboundMessage::text(-100, 1, "news"));
    for _ in 0..2 {
        assert_eq!(next_entry(&mut feed).await.status, LogStatus::Success);
    }
    let mut bodies = sink.bodies();
    bodies.sort();
    assert_eq!(bodies, vec!["[relay]\nnews".to_string(), "news".to_string()]);

    let report = engine.reload_from_store().await.unwrap();
    assert!(!report.changed());
    assert_eq!(report.unchanged, vec![1, 3]);
    engine.shutdown().await;
}

#[tokio::test]
async fn invalid_task_in_store_is_reported_and_skipped() {
    let broken = Task::new(9, 7, "no targets").with_source(-100);
    let store = Arc::new(MemoryStore::with_tasks([task(1), broken]).await);
    let engine = engine(store, Sinks::single(RecordingSink::new()), config());

    let report = engine.load_from_store().await.unwrap();
    assert_eq!(report.started, vec![1]);
    assert_eq!(report.invalid, vec![9]);
    assert!(engine.inert_tasks().contains_key(&9));
    assert_eq!(engine.dispatch(InboundMessage::text(-100, 1, "hi")).matched, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn unavailable_store_keeps_last_known_config() {
    let store = Arc::new(MemoryStore::with_tasks([task(1)]).await);
    let sink = RecordingSink::new();
    let engine = engine(store.clone(), Sinks::single(sink.clone()), config());
    engine.load_from_store().await.unwrap();

    store.set_unavailable(true);
    assert!(engine.reload_from_store().await.is_err());
    assert_eq!(engine.task_ids(), vec![1]);

    let mut feed = engine.subscribe_logs();
    engine.dispatch(InboundMessage::text(-100, 1, "still flowing"));
    assert_eq!(next_entry(&mut feed).await.status, LogStatus::Success);

    store.set_unavailable(false);
    engine.reload_from_store().await.unwrap();
    assert_eq!(engine.task_ids(), vec![1]);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unregister_drains_and_cancels_pending_retries() {
    let failing = Arc::new(FailingSink::default());
    let engine = engine(
        Arc::new(MemoryStore::new()),
        Sinks::single(failing.clone()),
        config(),
    );
    let mut task = task(1);
    task.limits.retry = Some(RetryPolicy {
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        max_attempts: 10,
        ordering: OrderingPolicy::Relaxed,
    });
    assert_eq!(
        engine.register_task(task).await.unwrap(),
        RegistrationOutcome::Started
    );
    let mut feed = engine.subscribe_logs();

    engine.dispatch(InboundMessage::text(-100, 1, "doomed"));
    while failing.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let lifecycle = engine.unregister_task(1).await.unwrap();
    assert_eq!(lifecycle.state, WorkerState::Stopped);

    let entry = next_entry(&mut feed).await;
    assert_eq!(entry.status, LogStatus::Failed);
    assert_eq!(entry.reason, Some(FailureReason::Cancelled));
    assert_eq!(entry.target_id, Some(-201));

    assert!(engine.task_ids().is_empty());
    assert_eq!(engine.dispatch(InboundMessage::text(-100, 2, "late")).matched, 0);
}

#[tokio::test]
async fn logs_reach_the_store() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone(), Sinks::single(RecordingSink::new()), config());
    engine.register_task(task(1)).await.unwrap();
    let mut feed = engine.subscribe_logs();

    engine.dispatch(InboundMessage::text(-100, 1, "persist me"));
    next_entry(&mut feed).await;
    engine.shutdown().await;

    // The writer runs in the background; give it a moment.
    for _ in 0..50 {
        if !store.recent_logs(1, 10).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let logs = store.recent_logs(1, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Success);
    assert_eq!(store.latest_stats(1).await.unwrap().unwrap().forwarded, 1);
}
