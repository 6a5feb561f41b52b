//! Worker lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// State of a task worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Created, not yet consuming.
    Idle,
    /// Consuming its inbound queue.
    Running,
    /// Queue closed; finishing queued messages and pending retries.
    Draining,
    /// Terminal.
    Stopped,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Idle, Running) | (Idle, Stopped) |
            (Running, Draining) |
            (Draining, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether the worker still accepts new messages.
    pub fn accepts_messages(&self) -> bool {
        matches!(self, Self::Idle | Self::Running)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkerState,
    pub to: WorkerState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Lifecycle record of one worker, shared with the engine for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerLifecycle {
    pub task_id: i64,
    pub state: WorkerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Number of hot reloads applied.
    pub reloads: u32,
    pub transitions: Vec<StateTransition>,
}

impl WorkerLifecycle {
    pub fn new(task_id: i64) -> Self {
        Self {
            task_id,
            state: WorkerState::Idle,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            reloads: 0,
            transitions: Vec::new(),
        }
    }

    pub fn transition_to(
        &mut self,
        new_state: WorkerState,
        reason: Option<String>,
    ) -> Result<(), TaskError> {
        if !self.state.can_transition_to(new_state) {
            return Err(TaskError::InvalidTransition {
                task_id: self.task_id,
                state: self.state.to_string(),
                target: new_state.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;

        match new_state {
            WorkerState::Running => self.started_at = Some(Utc::now()),
            WorkerState::Stopped => self.stopped_at = Some(Utc::now()),
            _ => {}
        }

        Ok(())
    }
}
