//! Events published by the engine for hosts and UIs

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::state::{Session, TaskStatus};
use crate::adapter::InteractionPayload;

/// Aggregate state over all active tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    /// No active tasks
    #[default]
    Idle,
    Running,
    WaitingForUser,
    Error,
}

impl OrchestratorState {
    /// Fold task statuses with precedence ERROR > WAITING_FOR_USER > RUNNING > IDLE
    pub fn aggregate(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        statuses
            .into_iter()
            .map(|status| match status {
                TaskStatus::Error => OrchestratorState::Error,
                TaskStatus::WaitingForUser => OrchestratorState::WaitingForUser,
                TaskStatus::Running => OrchestratorState::Running,
                TaskStatus::Pending | TaskStatus::Done => OrchestratorState::Idle,
            })
            .max_by_key(|state| state.rank())
            .unwrap_or_default()
    }

    fn rank(&self) -> u8 {
        match self {
            OrchestratorState::Idle => 0,
            OrchestratorState::Running => 1,
            OrchestratorState::WaitingForUser => 2,
            OrchestratorState::Error => 3,
        }
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorState::Idle => write!(f, "IDLE"),
            OrchestratorState::Running => write!(f, "RUNNING"),
            OrchestratorState::WaitingForUser => write!(f, "WAITING_FOR_USER"),
            OrchestratorState::Error => write!(f, "ERROR"),
        }
    }
}

/// Category of a reported error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Process failed to spawn
    Launch,
    /// Process failed after starting
    Runtime,
    /// Catalog pattern skipped
    PatternLoad,
    /// Snapshot write failed
    Persistence,
    /// Approval handler failed
    Handler,
    /// Writing to a process failed
    Input,
}

/// Something the host may want to render or act on
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Aggregate state changed
    StateChange {
        from: OrchestratorState,
        to: OrchestratorState,
        session: Arc<Session>,
    },
    /// A task changed status
    TaskStatusChange {
        task_id: String,
        status: TaskStatus,
        session: Arc<Session>,
    },
    /// Output from a task's process
    TaskOutput {
        task_id: String,
        raw: Vec<u8>,
        clean: String,
    },
    /// The classifier or adapter reported a named state
    TaskStateDetected { task_id: String, state: String },
    /// A task waits for `submit_interaction`
    InteractionNeeded {
        task_id: String,
        payload: InteractionPayload,
    },
    /// Failure report; non-fatal unless the task status says otherwise
    Error {
        kind: ErrorKind,
        task_id: Option<String>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_precedence() {
        use TaskStatus::*;

        assert_eq!(OrchestratorState::aggregate(Vec::<TaskStatus>::new()), OrchestratorState::Idle);
        assert_eq!(OrchestratorState::aggregate([Pending, Done]), OrchestratorState::Idle);
        assert_eq!(
            OrchestratorState::aggregate([Running, Done]),
            OrchestratorState::Running
        );
        assert_eq!(
            OrchestratorState::aggregate([Running, WaitingForUser]),
            OrchestratorState::WaitingForUser
        );
        assert_eq!(
            OrchestratorState::aggregate([WaitingForUser, Error, Running]),
            OrchestratorState::Error
        );
    }
}
