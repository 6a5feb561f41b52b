//! In-memory `ConfigStore` for tests and store-less runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::traits::{ConfigStore, task_not_found};
use crate::task::Task;
use crate::worker::recorder::ForwardingLogEntry;
use crate::worker::stats::StatsSnapshot;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<BTreeMap<i64, Task>>,
    logs: RwLock<Vec<ForwardingLogEntry>>,
    stats: RwLock<Vec<StatsSnapshot>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with tasks.
    pub async fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::new();
        {
            let mut map = store.tasks.write().await;
            for task in tasks {
                map.insert(task.id, task);
            }
        }
        store
    }

    /// Make task reads fail, simulating an unreachable store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every persisted log entry, in insertion order.
    pub async fn logs(&self) -> Vec<ForwardingLogEntry> {
        self.logs.read().await.clone()
    }

    /// Every persisted stats snapshot, in insertion order.
    pub async fn snapshots(&self) -> Vec<StatsSnapshot> {
        self.stats.read().await.clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_task(&self, task_id: i64) -> Result<Option<Task>, StoreError> {
        self.check_available()?;
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn load_all_active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect())
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.check_available()?;
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn delete_task(&self, task_id: i64) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.tasks.write().await.remove(&task_id).is_some())
    }

    async fn set_task_active(&self, task_id: i64, active: bool) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id).ok_or_else(|| task_not_found(task_id))?;
        task.active = active;
        Ok(())
    }

    async fn persist_log(&self, entry: &ForwardingLogEntry) -> Result<(), StoreError> {
        self.logs.write().await.push(entry.clone());
        Ok(())
    }

    async fn recent_logs(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<ForwardingLogEntry>, StoreError> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| e.task_id == task_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn persist_stats_snapshot(&self, snapshot: &StatsSnapshot) -> Result<(), StoreError> {
        self.stats.write().await.push(snapshot.clone());
        Ok(())
    }

    async fn latest_stats(&self, task_id: i64) -> Result<Option<StatsSnapshot>, StoreError> {
        Ok(self
            .stats
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.task_id == Some(task_id))
            .cloned())
    }
}
