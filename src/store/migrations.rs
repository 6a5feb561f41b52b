//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tasks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                owner_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                mode TEXT NOT NULL DEFAULT 'bot',
                active INTEGER NOT NULL DEFAULT 1,
                filters TEXT NOT NULL DEFAULT '{}',
                transforms TEXT NOT NULL DEFAULT '{}',
                limits TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_active ON tasks(active);

            CREATE TABLE IF NOT EXISTS task_sources (
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                chat_id INTEGER NOT NULL,
                title TEXT,
                position INTEGER NOT NULL,
                PRIMARY KEY (task_id, chat_id)
            );
            CREATE INDEX IF NOT EXISTS idx_task_sources_chat ON task_sources(chat_id);

            CREATE TABLE IF NOT EXISTS task_targets (
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                chat_id INTEGER NOT NULL,
                title TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                silent INTEGER NOT NULL DEFAULT 0,
                pin_on_send INTEGER NOT NULL DEFAULT 0,
                link_preview INTEGER NOT NULL DEFAULT 1,
                position INTEGER NOT NULL,
                PRIMARY KEY (task_id, chat_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "forwarding_logs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS forwarding_logs (
                id TEXT PRIMARY KEY,
                task_id INTEGER NOT NULL,
                source_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                target_id INTEGER,
                forwarded_message_id INTEGER,
                status TEXT NOT NULL,
                reason TEXT,
                detail TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_forwarding_logs_task
                ON forwarding_logs(task_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_forwarding_logs_status
                ON forwarding_logs(status);
        "#,
    },
    Migration {
        version: 3,
        name: "task_stats",
        sql: r#"
            CREATE TABLE IF NOT EXISTS task_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                seen INTEGER NOT NULL,
                forwarded INTEGER NOT NULL,
                filtered INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                duplicate INTEGER NOT NULL,
                dropped INTEGER NOT NULL,
                latency_total_ms INTEGER NOT NULL,
                latency_samples INTEGER NOT NULL,
                captured_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_stats_task
                ON task_stats(task_id, captured_at);
        "#,
    },
];

/// Run all pending migrations.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                StoreError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "tasks",
            "task_sources",
            "task_targets",
            "forwarding_logs",
            "task_stats",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[test]
    fn versions_are_sequential() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.version, i as i64 + 1, "migration {} out of order", m.name);
        }
    }
}
