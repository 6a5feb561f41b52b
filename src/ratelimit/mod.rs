//! Delivery throttling.
//!
//! `TokenBucket` gates each (task, target) pair. It never waits: a denial
//! carries the time until the next token so the worker can schedule a retry.
//! `quota::SendingQuota` caps a task's total sends per minute, hour and day.

pub mod quota;

use std::time::Duration;

use tokio::time::Instant;

pub use quota::{QuotaConfig, QuotaWindow, SendingQuota};

/// Outcome of `TokenBucket::try_acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    /// No token available; one will be after `retry_after`.
    Denied { retry_after: Duration },
}

impl Acquire {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

const EPSILON: f64 = 1e-9;

/// Fixed capacity, fixed refill rate. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Take one token if available. Non-blocking.
    pub fn try_acquire(&mut self, now: Instant) -> Acquire {
        self.refill(now);
        if self.tokens + EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Acquire::Granted
        } else {
            let missing = 1.0 - self.tokens;
            // Round up to whole milliseconds so a retry at `now + retry_after`
            // always finds the token.
            let millis = (missing / self.refill_per_sec * 1000.0).ceil();
            Acquire::Denied {
                retry_after: Duration::from_millis(millis.min(86_400_000.0) as u64),
            }
        }
    }

    /// Tokens currently available, after refilling to `now`.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }
}
