//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::worker::retry::RetryPolicy;

/// Engine-wide configuration. Per-task `LimitConfig` values override the
/// retry and dedup defaults here.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each worker's inbound queue.
    pub queue_capacity: usize,
    /// How long a draining worker waits for pending retries before cancelling them.
    pub drain_timeout: Duration,
    /// Upper bound on a single sink call before it counts as a transient failure.
    pub delivery_timeout: Duration,
    /// Interval between automatic reloads from the store (zero disables).
    pub reload_interval: Duration,
    /// Interval between statistics snapshots written to the store (zero disables).
    pub stats_flush_interval: Duration,
    /// Capacity of the fire-and-forget log persistence buffer.
    pub log_buffer: usize,
    /// Default retry policy for tasks that do not override it.
    pub retry: RetryPolicy,
    /// Default dedup cache capacity per task.
    pub dedup_capacity: usize,
    /// Default dedup retention window.
    pub dedup_retention: Duration,
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            drain_timeout: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(30),
            reload_interval: Duration::from_secs(300), // 5 minutes
            stats_flush_interval: Duration::from_secs(60),
            log_buffer: 1024,
            retry: RetryPolicy::default(),
            dedup_capacity: 10_000,
            dedup_retention: Duration::from_secs(3600), // 1 hour
            db_path: PathBuf::from("./data/relay.db"),
        }
    }
}

impl EngineConfig {
    /// Build from `RELAY_*` environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_capacity: env_parse("RELAY_QUEUE_CAPACITY", defaults.queue_capacity).max(1),
            drain_timeout: env_secs("RELAY_DRAIN_TIMEOUT_SECS", defaults.drain_timeout),
            delivery_timeout: env_secs("RELAY_DELIVERY_TIMEOUT_SECS", defaults.delivery_timeout),
            reload_interval: env_secs("RELAY_RELOAD_INTERVAL_SECS", defaults.reload_interval),
            stats_flush_interval: env_secs(
                "RELAY_STATS_FLUSH_INTERVAL_SECS",
                defaults.stats_flush_interval,
            ),
            log_buffer: env_parse("RELAY_LOG_BUFFER", defaults.log_buffer).max(1),
            retry: RetryPolicy {
                base_delay: env_millis("RELAY_RETRY_BASE_MS", defaults.retry.base_delay),
                max_delay: env_millis("RELAY_RETRY_MAX_MS", defaults.retry.max_delay),
                max_attempts: env_parse("RELAY_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)
                    .max(1),
                ordering: defaults.retry.ordering,
            },
            dedup_capacity: env_parse("RELAY_DEDUP_CAPACITY", defaults.dedup_capacity),
            dedup_retention: env_secs("RELAY_DEDUP_RETENTION_SECS", defaults.dedup_retention),
            db_path: std::env::var("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}
