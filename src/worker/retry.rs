//! Retry policy and backoff computation.
//!
//! Rate-limit denials and transient sink failures share one attempt budget
//! per (message, target). Retries run as timer continuations owned by the
//! worker; nothing here sleeps.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether retries for one target may complete after later messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Later messages are delivered while an earlier one is still retrying.
    /// Completion order per target may differ from arrival order.
    #[default]
    Relaxed,
    /// Each target delivers strictly in arrival order. A retrying message
    /// holds back every later message for the same target.
    PerTarget,
}

impl fmt::Display for OrderingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relaxed => write!(f, "relaxed"),
            Self::PerTarget => write!(f, "per_target"),
        }
    }
}

impl FromStr for OrderingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "relaxed" => Ok(Self::Relaxed),
            "per_target" | "per-target" | "ordered" => Ok(Self::PerTarget),
            other => Err(format!("unknown ordering policy: {other}")),
        }
    }
}

/// Exponential backoff with a cap and a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound on any single wait.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(default)]
    pub ordering: OrderingPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            ordering: OrderingPolicy::Relaxed,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Wait before the next attempt, or `None` once the budget is spent.
    ///
    /// A `hint` from the limiter or the sink raises the wait so a retry never
    /// fires before the resource can be available, still capped at `max_delay`.
    pub fn next_delay(&self, attempt: u32, hint: Option<Duration>) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let backoff = self.backoff(attempt);
        let delay = match hint {
            Some(hint) => backoff.max(hint),
            None => backoff,
        };
        Some(delay.min(self.max_delay))
    }

    pub fn is_ordered(&self) -> bool {
        self.ordering == OrderingPolicy::PerTarget
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
