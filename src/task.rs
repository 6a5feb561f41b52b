//! Task definitions: the unit of forwarding configuration.

use std::fmt;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::dedup::DedupScope;
use crate::error::TaskError;
use crate::pipeline::filters::FilterConfig;
use crate::pipeline::transforms::TransformConfig;
use crate::pipeline::types::DeliveryOptions;
use crate::ratelimit::quota::QuotaConfig;
use crate::worker::retry::RetryPolicy;

/// Which platform identity relays the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    #[default]
    Bot,
    Account,
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bot => write!(f, "bot"),
            Self::Account => write!(f, "account"),
        }
    }
}

impl std::str::FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bot" => Ok(Self::Bot),
            "account" | "userbot" => Ok(Self::Account),
            other => Err(format!("unknown task mode: {other}")),
        }
    }
}

/// A channel a task listens to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub chat_id: i64,
    #[serde(default)]
    pub task_id: i64,
    #[serde(default)]
    pub title: Option<String>,
}

/// A channel a task delivers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub chat_id: i64,
    #[serde(default)]
    pub task_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub pin_on_send: bool,
    #[serde(default = "default_true")]
    pub link_preview: bool,
}

impl Target {
    pub fn new(chat_id: i64) -> Self {
        Self {
            chat_id,
            task_id: 0,
            title: None,
            active: true,
            silent: false,
            pin_on_send: false,
            link_preview: true,
        }
    }

    pub fn options(&self, mode: TaskMode) -> DeliveryOptions {
        DeliveryOptions {
            mode,
            silent: self.silent,
            pin: self.pin_on_send,
            link_preview: self.link_preview,
        }
    }
}

/// Token bucket parameters applied to each target of a task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum burst size.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

/// Throughput, retry and dedup limits for one task.
///
/// `None` fields fall back to the engine-wide defaults in `EngineConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Per-target token bucket; `None` means unthrottled.
    pub rate: Option<RateLimitConfig>,
    pub retry: Option<RetryPolicy>,
    pub dedup_capacity: Option<usize>,
    pub dedup_retention_secs: Option<u64>,
    pub dedup_scope: DedupScope,
    pub quota: QuotaConfig,
    /// Random pause before the first delivery attempt, in seconds.
    pub delay_min_secs: u64,
    pub delay_max_secs: u64,
    /// IANA timezone name used by time-of-day and weekday filters.
    pub timezone: String,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            rate: None,
            retry: None,
            dedup_capacity: None,
            dedup_retention_secs: None,
            dedup_scope: DedupScope::default(),
            quota: QuotaConfig::default(),
            delay_min_secs: 0,
            delay_max_secs: 0,
            timezone: "UTC".to_string(),
        }
    }
}

impl LimitConfig {
    /// Parse the configured timezone.
    pub fn tz(&self) -> Result<Tz, String> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| format!("invalid timezone {:?}: {e}", self.timezone))
    }

    /// Inclusive delay range, or `None` when no delay is configured.
    pub fn delay_range(&self) -> Option<(Duration, Duration)> {
        if self.delay_max_secs == 0 {
            return None;
        }
        let min = self.delay_min_secs.min(self.delay_max_secs);
        Some((
            Duration::from_secs(min),
            Duration::from_secs(self.delay_max_secs),
        ))
    }
}

/// A forwarding task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub transforms: TransformConfig,
    #[serde(default)]
    pub limits: LimitConfig,
}

impl Task {
    pub fn new(id: i64, owner_id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            owner_id,
            name: name.into(),
            mode: TaskMode::Bot,
            active: true,
            sources: Vec::new(),
            targets: Vec::new(),
            filters: FilterConfig::default(),
            transforms: TransformConfig::default(),
            limits: LimitConfig::default(),
        }
    }

    pub fn with_source(mut self, chat_id: i64) -> Self {
        self.sources.push(Source {
            chat_id,
            task_id: self.id,
            title: None,
        });
        self
    }

    pub fn with_target(mut self, chat_id: i64) -> Self {
        let mut target = Target::new(chat_id);
        target.task_id = self.id;
        self.targets.push(target);
        self
    }

    /// Targets that should receive deliveries.
    pub fn active_targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter().filter(|t| t.active)
    }

    /// Source chat ids, deduplicated, in configured order.
    pub fn source_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            if !ids.contains(&source.chat_id) {
                ids.push(source.chat_id);
            }
        }
        ids
    }

    /// Structural validation. A task failing this is inert: it never gets a
    /// worker and never receives events. Pattern compilation is checked when
    /// the pipeline is built.
    pub fn validate(&self) -> Result<(), TaskError> {
        let invalid = |reason: String| TaskError::ConfigurationInvalid {
            task_id: self.id,
            reason,
        };
        if self.sources.is_empty() {
            return Err(invalid("task has no sources".into()));
        }
        if self.active_targets().next().is_none() {
            return Err(invalid("task has no active targets".into()));
        }
        self.limits.tz().map_err(invalid)?;
        if let Some(rate) = &self.limits.rate {
            if rate.capacity == 0 || !(rate.refill_per_sec > 0.0) {
                return Err(invalid(format!(
                    "rate limit needs capacity > 0 and refill > 0, got {} / {}",
                    rate.capacity, rate.refill_per_sec
                )));
            }
        }
        if let Some(retry) = &self.limits.retry {
            if retry.max_attempts == 0 {
                return Err(invalid("retry policy needs at least one attempt".into()));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
