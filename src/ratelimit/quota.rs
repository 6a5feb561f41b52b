//! Rolling per-minute / per-hour / per-day send caps for one task.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Caps on messages sent; zero disables a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl QuotaConfig {
    pub fn is_unlimited(&self) -> bool {
        self.per_minute == 0 && self.per_hour == 0 && self.per_day == 0
    }
}

/// Which window ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaWindow {
    Minute,
    Hour,
    Day,
}

impl fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minute => write!(f, "minute"),
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
        }
    }
}

/// Sliding-window counter over recent sends.
#[derive(Debug)]
pub struct SendingQuota {
    config: QuotaConfig,
    sent: VecDeque<Instant>,
}

impl SendingQuota {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            sent: VecDeque::new(),
        }
    }

    pub fn config(&self) -> QuotaConfig {
        self.config
    }

    /// Record a send if every window has room, otherwise report the first
    /// exhausted window and record nothing.
    pub fn try_reserve(&mut self, now: Instant) -> Result<(), QuotaWindow> {
        if self.config.is_unlimited() {
            return Ok(());
        }
        self.prune(now);
        let checks = [
            (self.config.per_minute, MINUTE, QuotaWindow::Minute),
            (self.config.per_hour, HOUR, QuotaWindow::Hour),
            (self.config.per_day, DAY, QuotaWindow::Day),
        ];
        for (limit, span, window) in checks {
            if limit > 0 && self.count_within(now, span) >= limit as usize {
                return Err(window);
            }
        }
        self.sent.push_back(now);
        Ok(())
    }

    fn count_within(&self, now: Instant, span: Duration) -> usize {
        // Newest entries are at the back.
        self.sent
            .iter()
            .rev()
            .take_while(|at| now.saturating_duration_since(**at) < span)
            .count()
    }

    fn prune(&mut self, now: Instant) {
        let keep = if self.config.per_day > 0 {
            DAY
        } else if self.config.per_hour > 0 {
            HOUR
        } else {
            MINUTE
        };
        while let Some(at) = self.sent.front() {
            if now.saturating_duration_since(*at) < keep {
                break;
            }
            self.sent.pop_front();
        }
    }
}
