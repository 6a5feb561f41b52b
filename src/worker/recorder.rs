//! Forwarding log entries and their fire-and-forget persistence.
//!
//! Workers hand entries to a [`LogRecorder`], which pushes them onto a
//! bounded channel drained by a background writer. A full channel drops the
//! entry with a warning; delivery never waits on persistence. Every entry is
//! also broadcast to live subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::ConfigStore;

/// Terminal outcome of a message (or of one target of a message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Filtered,
    Failed,
    Duplicate,
    Dropped,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Filtered => "filtered",
            Self::Failed => "failed",
            Self::Duplicate => "duplicate",
            Self::Dropped => "dropped",
        }
    }
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "filtered" => Ok(Self::Filtered),
            "failed" => Ok(Self::Failed),
            "duplicate" => Ok(Self::Duplicate),
            "dropped" => Ok(Self::Dropped),
            other => Err(format!("unknown log status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Filtered,
    Duplicate,
    Transient,
    Permanent,
    RateLimited,
    QuotaExceeded,
    Backpressure,
    Cancelled,
    ConfigurationInvalid,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filtered => "filtered",
            Self::Duplicate => "duplicate",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Backpressure => "backpressure",
            Self::Cancelled => "cancelled",
            Self::ConfigurationInvalid => "configuration_invalid",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filtered" => Ok(Self::Filtered),
            "duplicate" => Ok(Self::Duplicate),
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            "rate_limited" => Ok(Self::RateLimited),
            "quota_exceeded" => Ok(Self::QuotaExceeded),
            "backpressure" => Ok(Self::Backpressure),
            "cancelled" => Ok(Self::Cancelled),
            "configuration_invalid" => Ok(Self::ConfigurationInvalid),
            other => Err(format!("unknown failure reason '{other}'")),
        }
    }
}

/// One immutable log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingLogEntry {
    pub id: Uuid,
    pub task_id: i64,
    pub source_id: i64,
    pub message_id: i64,
    /// `None` for per-message outcomes (filtered, duplicate, dropped).
    pub target_id: Option<i64>,
    pub forwarded_message_id: Option<i64>,
    pub status: LogStatus,
    pub reason: Option<FailureReason>,
    pub detail: Option<String>,
    pub attempts: u32,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ForwardingLogEntry {
    pub fn new(task_id: i64, source_id: i64, message_id: i64, status: LogStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            source_id,
            message_id,
            target_id: None,
            forwarded_message_id: None,
            status,
            reason: None,
            detail: None,
            attempts: 0,
            latency_ms: 0,
            created_at: Utc::now(),
        }
    }

    pub fn target(mut self, target_id: i64) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn reason(mut self, reason: FailureReason, detail: impl Into<String>) -> Self {
        self.reason = Some(reason);
        self.detail = Some(detail.into());
        self
    }

    pub fn forwarded_as(mut self, message_id: i64) -> Self {
        self.forwarded_message_id = Some(message_id);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn latency(mut self, latency: std::time::Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }
}

/// Cloneable handle that queues log entries for persistence.
#[derive(Clone)]
pub struct LogRecorder {
    tx: mpsc::Sender<ForwardingLogEntry>,
    events: broadcast::Sender<ForwardingLogEntry>,
}

impl LogRecorder {
    /// Start the background writer. It exits once every recorder clone is
    /// dropped and the queue is empty.
    pub fn spawn(store: Arc<dyn ConfigStore>, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ForwardingLogEntry>(buffer.max(1));
        let (events, _) = broadcast::channel(buffer.max(16));

        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = store.persist_log(&entry).await {
                    warn!(
                        task_id = entry.task_id,
                        status = %entry.status,
                        error = %e,
                        "Failed to persist forwarding log"
                    );
                }
            }
            debug!("Log writer stopped");
        });

        (Self { tx, events }, handle)
    }

    pub fn record(&self, entry: ForwardingLogEntry) {
        // No subscribers is fine.
        let _ = self.events.send(entry.clone());

        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(entry)) => {
                warn!(
                    task_id = entry.task_id,
                    status = %entry.status,
                    "Log buffer full, dropping entry"
                );
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                debug!(task_id = entry.task_id, "Log writer closed, dropping entry");
            }
        }
    }

    /// Live feed of every recorded entry, persisted or not.
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardingLogEntry> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for LogRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRecorder")
            .field("capacity", &self.tx.max_capacity())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn status_and_reason_strings() {
        assert_eq!(LogStatus::Duplicate.to_string(), "duplicate");
        assert_eq!("dropped".parse::<LogStatus>().unwrap(), LogStatus::Dropped);
        assert_eq!(FailureReason::RateLimited.as_str(), "rate_limited");
        assert_eq!(
            "quota_exceeded".parse::<FailureReason>().unwrap(),
            FailureReason::QuotaExceeded
        );
        assert!("nope".parse::<FailureReason>().is_err());
        let json = serde_json::to_string(&FailureReason::ConfigurationInvalid).unwrap();
        assert_eq!(json, "\"configuration_invalid\"");
    }

    #[test]
    fn entry_builder() {
        let entry = ForwardingLogEntry::new(1, -100, 5, LogStatus::Failed)
            .target(-200)
            .reason(FailureReason::Permanent, "chat not found")
            .attempts(1);
        assert_eq!(entry.target_id, Some(-200));
        assert_eq!(entry.reason, Some(FailureReason::Permanent));
        assert_eq!(entry.detail.as_deref(), Some("chat not found"));
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn writer_persists_and_broadcasts() {
        let store = Arc::new(MemoryStore::new());
        let (recorder, handle) = LogRecorder::spawn(store.clone(), 8);
        let mut feed = recorder.subscribe();

        recorder.record(ForwardingLogEntry::new(1, -100, 5, LogStatus::Success).target(-200));
        let seen = feed.recv().await.unwrap();
        assert_eq!(seen.status, LogStatus::Success);

        drop(recorder);
        handle.await.unwrap();
        let logs = store.logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].target_id, Some(-200));
    }

    #[tokio::test]
    async fn full_buffer_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(16);
        let recorder = LogRecorder { tx, events };
        recorder.record(ForwardingLogEntry::new(1, 1, 1, LogStatus::Success));
        // Second entry finds the channel full and is dropped.
        recorder.record(ForwardingLogEntry::new(1, 1, 2, LogStatus::Success));
        assert_eq!(rx.recv().await.unwrap().message_id, 1);
        assert!(rx.try_recv().is_err());
    }
}
