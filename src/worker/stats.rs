//! Per-task counters.
//!
//! Counters are atomics so reporting never waits on the worker. Each task's
//! counters are written only by its own worker and the dispatch path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::recorder::LogStatus;

#[derive(Debug, Default)]
pub struct TaskStatistics {
    seen: AtomicU64,
    forwarded: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
    duplicate: AtomicU64,
    dropped: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
}

impl TaskStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_seen(&self) {
        self.seen.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one terminal outcome. Latency is averaged over successes only.
    pub fn record(&self, status: LogStatus, latency: Duration) {
        let counter = match status {
            LogStatus::Success => {
                self.latency_total_ms
                    .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
                self.latency_samples.fetch_add(1, Ordering::Relaxed);
                &self.forwarded
            }
            LogStatus::Filtered => &self.filtered,
            LogStatus::Failed => &self.failed,
            LogStatus::Duplicate => &self.duplicate,
            LogStatus::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, task_id: i64) -> StatsSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total = self.latency_total_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            task_id: Some(task_id),
            seen: self.seen.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            latency_total_ms: total,
            latency_samples: samples,
            avg_latency_ms: average(total, samples),
            captured_at: Utc::now(),
        }
    }
}

/// Point-in-time copy of a task's counters, or a global aggregate when
/// `task_id` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub task_id: Option<i64>,
    pub seen: u64,
    pub forwarded: u64,
    pub filtered: u64,
    pub failed: u64,
    pub duplicate: u64,
    pub dropped: u64,
    pub latency_total_ms: u64,
    pub latency_samples: u64,
    pub avg_latency_ms: f64,
    pub captured_at: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn empty(task_id: Option<i64>) -> Self {
        Self {
            task_id,
            seen: 0,
            forwarded: 0,
            filtered: 0,
            failed: 0,
            duplicate: 0,
            dropped: 0,
            latency_total_ms: 0,
            latency_samples: 0,
            avg_latency_ms: 0.0,
            captured_at: Utc::now(),
        }
    }

    /// Sum several snapshots into a global one.
    pub fn aggregate<'a>(snapshots: impl IntoIterator<Item = &'a StatsSnapshot>) -> Self {
        let mut total = Self::empty(None);
        for s in snapshots {
            total.seen += s.seen;
            total.forwarded += s.forwarded;
            total.filtered += s.filtered;
            total.failed += s.failed;
            total.duplicate += s.duplicate;
            total.dropped += s.dropped;
            total.latency_total_ms += s.latency_total_ms;
            total.latency_samples += s.latency_samples;
        }
        total.avg_latency_ms = average(total.latency_total_ms, total.latency_samples);
        total
    }

    /// Messages that reached a terminal outcome per target or per message.
    pub fn outcomes(&self) -> u64 {
        self.forwarded + self.filtered + self.failed + self.duplicate + self.dropped
    }
}

fn average(total_ms: u64, samples: u64) -> f64 {
    if samples == 0 {
        0.0
    } else {
        total_ms as f64 / samples as f64
    }
}
