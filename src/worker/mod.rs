//! Worker system: one isolated consumer per forwarding task.
//!
//! Core components:
//! - `state`: Worker state machine (Idle → Running → Draining → Stopped)
//! - `retry`: Backoff and ordering policy for delivery retries
//! - `stats`: Lock-free per-task counters
//! - `recorder`: Forwarding log entries and their background persistence
//! - `worker`: The consume loop, delivery continuations and drain

pub mod recorder;
pub mod retry;
pub mod state;
pub mod stats;
pub mod worker;

pub use recorder::{FailureReason, ForwardingLogEntry, LogRecorder, LogStatus};
pub use retry::{OrderingPolicy, RetryPolicy};
pub use state::{WorkerLifecycle, WorkerState};
pub use stats::{StatsSnapshot, TaskStatistics};
pub use worker::{TaskRuntime, TaskWorker, WorkerCommand, WorkerDeps, WorkerHandle};
