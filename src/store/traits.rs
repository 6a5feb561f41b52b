//! `ConfigStore` trait: single async interface for task definitions,
//! forwarding logs and statistics snapshots.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::task::Task;
use crate::worker::recorder::ForwardingLogEntry;
use crate::worker::stats::StatsSnapshot;

/// Backend-agnostic persistence used by the engine.
///
/// Tasks are the durable source of truth; the engine only holds a reloadable
/// copy. Logs and snapshots are written fire-and-forget.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Load one task, active or not.
    async fn load_task(&self, task_id: i64) -> Result<Option<Task>, StoreError>;

    /// Every task with `active = true`, ordered by id.
    async fn load_all_active_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Insert or replace a task with its sources and targets.
    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Delete a task. Returns `false` if it did not exist.
    async fn delete_task(&self, task_id: i64) -> Result<bool, StoreError>;

    /// Flip a task's active flag.
    async fn set_task_active(&self, task_id: i64, active: bool) -> Result<(), StoreError>;

    // ── Logs ────────────────────────────────────────────────────────

    async fn persist_log(&self, entry: &ForwardingLogEntry) -> Result<(), StoreError>;

    /// Most recent log entries for a task, newest first.
    async fn recent_logs(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<ForwardingLogEntry>, StoreError>;

    // ── Statistics ──────────────────────────────────────────────────

    async fn persist_stats_snapshot(&self, snapshot: &StatsSnapshot) -> Result<(), StoreError>;

    /// Latest snapshot written for a task.
    async fn latest_stats(&self, task_id: i64) -> Result<Option<StatsSnapshot>, StoreError>;
}

pub(crate) fn task_not_found(task_id: i64) -> StoreError {
    StoreError::NotFound {
        entity: "task".into(),
        id: task_id.to_string(),
    }
}
