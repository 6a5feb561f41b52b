use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;

use relay_engine::channels::{CliListener, Sinks, StdoutSink};
use relay_engine::config::EngineConfig;
use relay_engine::engine::{self, ForwardingEngine};
use relay_engine::store::{ConfigStore, LibSqlStore};
use relay_engine::task::Task;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing()?;

    let config = EngineConfig::from_env();

    eprintln!("📨 Relay Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Queue capacity: {}", config.queue_capacity);

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = config.db_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store: Arc<dyn ConfigStore> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );

    // Optional task import: a JSON array of task definitions.
    if let Ok(path) = std::env::var("RELAY_TASKS_FILE") {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {path}"))?;
        let tasks: Vec<Task> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?;
        for task in &tasks {
            store.save_task(task).await?;
        }
        eprintln!("   Imported {} tasks from {}", tasks.len(), path);
    }

    // ── Engine ───────────────────────────────────────────────────────────
    let reload_interval = config.reload_interval;
    let stats_interval = config.stats_flush_interval;
    let sinks = Sinks::single(Arc::new(StdoutSink::new()));
    let engine = Arc::new(ForwardingEngine::new(config, store, sinks, None));

    let report = engine.load_from_store().await?;
    eprintln!(
        "   Tasks: {} running, {} invalid",
        report.started.len(),
        report.invalid.len()
    );
    eprintln!("   Input: <source_id> [<media>:<file_id>] <text>, one per line\n");

    let reload_ticker = engine::spawn_reload_ticker(&engine, reload_interval);
    let stats_flusher = engine::spawn_stats_flusher(&engine, stats_interval);

    let mut listener = tokio::spawn(CliListener::stdin().run(Arc::clone(&engine)));

    tokio::select! {
        result = &mut listener => {
            match result {
                Ok(dispatched) => tracing::info!(dispatched, "Input closed"),
                Err(e) => tracing::error!(error = %e, "Listener task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            listener.abort();
        }
    }

    reload_ticker.abort();
    stats_flusher.abort();

    let stopped = engine.shutdown().await;
    tracing::info!(workers = stopped.len(), "All workers stopped");

    // The writer exits once the last recorder clone goes away with the engine.
    let log_writer = engine.take_log_writer();
    drop(engine);
    if let Some(writer) = log_writer {
        if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
            tracing::warn!("Log writer did not finish in time");
        }
    }

    Ok(())
}

/// Console logging filtered by `RUST_LOG` (default `info`). With
/// `RELAY_LOG_DIR` set, logs go to a daily rolling file instead.
fn init_tracing() -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match std::env::var("RELAY_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("relay")
                .filename_suffix("log")
                .build(&dir)
                .with_context(|| format!("creating log appender in {dir}"))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .init();
            Ok(None)
        }
    }
}
