//! libSQL backend: async `ConfigStore` implementation.
//!
//! Supports local file and in-memory databases. Task sources and targets
//! live in their own tables; filter, transform and limit configuration is
//! stored as JSON columns.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{ConfigStore, task_not_found};
use crate::task::{Source, Target, Task, TaskMode};
use crate::worker::recorder::{FailureReason, ForwardingLogEntry, LogStatus};
use crate::worker::stats::StatsSnapshot;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Attach sources and targets to a task row.
    async fn hydrate(&self, mut task: Task) -> Result<Task, StoreError> {
        let conn = self.conn();

        let mut rows = conn
            .query(
                "SELECT chat_id, title FROM task_sources WHERE task_id = ?1 ORDER BY position",
                params![task.id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("load sources: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("load sources: {e}")))?
        {
            task.sources.push(Source {
                chat_id: row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("source row parse: {e}")))?,
                task_id: task.id,
                title: row.get::<String>(1).ok(),
            });
        }

        let mut rows = conn
            .query(
                "SELECT chat_id, title, active, silent, pin_on_send, link_preview
                 FROM task_targets WHERE task_id = ?1 ORDER BY position",
                params![task.id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("load targets: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("load targets: {e}")))?
        {
            task.targets.push(
                row_to_target(&row, task.id)
                    .map_err(|e| StoreError::Query(format!("target row parse: {e}")))?,
            );
        }

        Ok(task)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(format!("{what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(format!("{what}: {e}")))
}

const TASK_COLUMNS: &str = "id, owner_id, name, mode, active, filters, transforms, limits";

/// Task row without sources and targets.
fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let parse = |e: libsql::Error| StoreError::Query(format!("task row parse: {e}"));
    let id: i64 = row.get(0).map_err(parse)?;
    let owner_id: i64 = row.get(1).map_err(parse)?;
    let name: String = row.get(2).map_err(parse)?;
    let mode_str: String = row.get(3).map_err(parse)?;
    let active: i64 = row.get(4).map_err(parse)?;
    let filters: String = row.get(5).map_err(parse)?;
    let transforms: String = row.get(6).map_err(parse)?;
    let limits: String = row.get(7).map_err(parse)?;

    let mut task = Task::new(id, owner_id, name);
    task.mode = mode_str.parse::<TaskMode>().unwrap_or_default();
    task.active = active != 0;
    task.filters = from_json(&filters, "filters")?;
    task.transforms = from_json(&transforms, "transforms")?;
    task.limits = from_json(&limits, "limits")?;
    Ok(task)
}

fn row_to_target(row: &libsql::Row, task_id: i64) -> Result<Target, libsql::Error> {
    let mut target = Target::new(row.get(0)?);
    target.task_id = task_id;
    target.title = row.get::<String>(1).ok();
    target.active = row.get::<i64>(2)? != 0;
    target.silent = row.get::<i64>(3)? != 0;
    target.pin_on_send = row.get::<i64>(4)? != 0;
    target.link_preview = row.get::<i64>(5)? != 0;
    Ok(target)
}

const LOG_COLUMNS: &str = "id, task_id, source_id, message_id, target_id, forwarded_message_id, \
     status, reason, detail, attempts, latency_ms, created_at";

fn row_to_log(row: &libsql::Row) -> Result<ForwardingLogEntry, StoreError> {
    let parse = |e: libsql::Error| StoreError::Query(format!("log row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let status: String = row.get(6).map_err(parse)?;
    let created_at: String = row.get(11).map_err(parse)?;

    Ok(ForwardingLogEntry {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Serialization(format!("log id: {e}")))?,
        task_id: row.get(1).map_err(parse)?,
        source_id: row.get(2).map_err(parse)?,
        message_id: row.get(3).map_err(parse)?,
        target_id: row.get::<i64>(4).ok(),
        forwarded_message_id: row.get::<i64>(5).ok(),
        status: status
            .parse::<LogStatus>()
            .map_err(StoreError::Serialization)?,
        reason: row
            .get::<String>(7)
            .ok()
            .and_then(|r| r.parse::<FailureReason>().ok()),
        detail: row.get::<String>(8).ok(),
        attempts: row.get::<i64>(9).map_err(parse)? as u32,
        latency_ms: row.get::<i64>(10).map_err(parse)? as u64,
        created_at: parse_datetime(&created_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ConfigStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn load_task(&self, task_id: i64) -> Result<Option<Task>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("load_task: {e}")))?;

        let task = match rows.next().await {
            Ok(Some(row)) => row_to_task(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(StoreError::Query(format!("load_task: {e}"))),
        };
        Ok(Some(self.hydrate(task).await?))
    }

    async fn load_all_active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE active = 1 ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("load_all_active_tasks: {e}")))?;

        let mut headers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("load_all_active_tasks: {e}")))?
        {
            headers.push(row_to_task(&row)?);
        }

        let mut tasks = Vec::with_capacity(headers.len());
        for task in headers {
            tasks.push(self.hydrate(task).await?);
        }
        Ok(tasks)
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let filters = to_json(&task.filters, "filters")?;
        let transforms = to_json(&task.transforms, "transforms")?;
        let limits = to_json(&task.limits, "limits")?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| StoreError::Query(format!("save_task begin: {e}")))?;

        tx.execute(
            "INSERT INTO tasks (id, owner_id, name, mode, active, filters, transforms, limits,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                name = excluded.name,
                mode = excluded.mode,
                active = excluded.active,
                filters = excluded.filters,
                transforms = excluded.transforms,
                limits = excluded.limits,
                updated_at = excluded.updated_at",
            params![
                task.id,
                task.owner_id,
                task.name.clone(),
                task.mode.to_string(),
                i64::from(task.active),
                filters,
                transforms,
                limits,
                now,
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("save_task: {e}")))?;

        tx.execute("DELETE FROM task_sources WHERE task_id = ?1", params![task.id])
            .await
            .map_err(|e| StoreError::Query(format!("save_task sources: {e}")))?;
        for (position, source) in task.sources.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO task_sources (task_id, chat_id, title, position)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    task.id,
                    source.chat_id,
                    opt_text(source.title.as_deref()),
                    position as i64
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_task sources: {e}")))?;
        }

        tx.execute("DELETE FROM task_targets WHERE task_id = ?1", params![task.id])
            .await
            .map_err(|e| StoreError::Query(format!("save_task targets: {e}")))?;
        for (position, target) in task.targets.iter().enumerate() {
            tx.execute(
                "INSERT OR REPLACE INTO task_targets
                    (task_id, chat_id, title, active, silent, pin_on_send, link_preview, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.id,
                    target.chat_id,
                    opt_text(target.title.as_deref()),
                    i64::from(target.active),
                    i64::from(target.silent),
                    i64::from(target.pin_on_send),
                    i64::from(target.link_preview),
                    position as i64
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_task targets: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(format!("save_task commit: {e}")))?;

        debug!(task_id = task.id, "Task saved");
        Ok(())
    }

    async fn delete_task(&self, task_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn();
        conn.execute("DELETE FROM task_sources WHERE task_id = ?1", params![task_id])
            .await
            .map_err(|e| StoreError::Query(format!("delete_task sources: {e}")))?;
        conn.execute("DELETE FROM task_targets WHERE task_id = ?1", params![task_id])
            .await
            .map_err(|e| StoreError::Query(format!("delete_task targets: {e}")))?;
        let deleted = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![task_id])
            .await
            .map_err(|e| StoreError::Query(format!("delete_task: {e}")))?;

        debug!(task_id, deleted, "Task deleted");
        Ok(deleted > 0)
    }

    async fn set_task_active(&self, task_id: i64, active: bool) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()
            .execute(
                "UPDATE tasks SET active = ?1, updated_at = ?2 WHERE id = ?3",
                params![i64::from(active), now, task_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_task_active: {e}")))?;

        if updated == 0 {
            return Err(task_not_found(task_id));
        }
        Ok(())
    }

    async fn persist_log(&self, entry: &ForwardingLogEntry) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO forwarding_logs ({LOG_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    entry.id.to_string(),
                    entry.task_id,
                    entry.source_id,
                    entry.message_id,
                    opt_int(entry.target_id),
                    opt_int(entry.forwarded_message_id),
                    entry.status.as_str(),
                    opt_text(entry.reason.as_ref().map(FailureReason::as_str)),
                    opt_text(entry.detail.as_deref()),
                    i64::from(entry.attempts),
                    entry.latency_ms as i64,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("persist_log: {e}")))?;
        Ok(())
    }

    async fn recent_logs(
        &self,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<ForwardingLogEntry>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM forwarding_logs WHERE task_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![task_id, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("recent_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("recent_logs: {e}")))?
        {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }

    async fn persist_stats_snapshot(&self, snapshot: &StatsSnapshot) -> Result<(), StoreError> {
        let Some(task_id) = snapshot.task_id else {
            return Err(StoreError::Serialization(
                "global snapshots are not persisted".into(),
            ));
        };

        self.conn()
            .execute(
                "INSERT INTO task_stats (task_id, seen, forwarded, filtered, failed, duplicate,
                    dropped, latency_total_ms, latency_samples, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task_id,
                    snapshot.seen as i64,
                    snapshot.forwarded as i64,
                    snapshot.filtered as i64,
                    snapshot.failed as i64,
                    snapshot.duplicate as i64,
                    snapshot.dropped as i64,
                    snapshot.latency_total_ms as i64,
                    snapshot.latency_samples as i64,
                    snapshot.captured_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("persist_stats_snapshot: {e}")))?;
        Ok(())
    }

    async fn latest_stats(&self, task_id: i64) -> Result<Option<StatsSnapshot>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT seen, forwarded, filtered, failed, duplicate, dropped,
                    latency_total_ms, latency_samples, captured_at
                 FROM task_stats WHERE task_id = ?1 ORDER BY id DESC LIMIT 1",
                params![task_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("latest_stats: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(StoreError::Query(format!("latest_stats: {e}"))),
        };

        let parse = |e: libsql::Error| StoreError::Query(format!("stats row parse: {e}"));
        let count = |i: i32| row.get::<i64>(i).map(|v| v as u64).map_err(parse);
        let captured_at: String = row.get(8).map_err(parse)?;

        let mut snapshot = StatsSnapshot::empty(Some(task_id));
        snapshot.seen = count(0)?;
        snapshot.forwarded = count(1)?;
        snapshot.filtered = count(2)?;
        snapshot.failed = count(3)?;
        snapshot.duplicate = count(4)?;
        snapshot.dropped = count(5)?;
        snapshot.latency_total_ms = count(6)?;
        snapshot.latency_samples = count(7)?;
        snapshot.avg_latency_ms = if snapshot.latency_samples == 0 {
            0.0
        } else {
            snapshot.latency_total_ms as f64 / snapshot.latency_samples as f64
        };
        snapshot.captured_at = parse_datetime(&captured_at);
        Ok(Some(snapshot))
    }
}
