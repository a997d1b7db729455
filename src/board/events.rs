use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{
    ExecutionProgress, ReviewReason, Subtask, Task, TaskStatus, WorkerKind,
};

/// Which worker stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Everything the board tells the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BoardEvent {
    TaskCreated {
        task: Task,
    },
    StatusChanged {
        task_id: String,
        status: TaskStatus,
        review_reason: Option<ReviewReason>,
    },
    ProgressUpdated {
        task_id: String,
        progress: ExecutionProgress,
    },
    SubtasksUpdated {
        task_id: String,
        subtasks: Vec<Subtask>,
    },
    Log {
        task_id: String,
        stream: LogStream,
        line: String,
    },
    Error {
        task_id: String,
        message: String,
    },
    WorkerExited {
        task_id: String,
        kind: WorkerKind,
        code: Option<i32>,
    },
    TaskDeleted {
        task_id: String,
    },
}

impl BoardEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::TaskCreated { task } => &task.id,
            Self::StatusChanged { task_id, .. }
            | Self::ProgressUpdated { task_id, .. }
            | Self::SubtasksUpdated { task_id, .. }
            | Self::Log { task_id, .. }
            | Self::Error { task_id, .. }
            | Self::WorkerExited { task_id, .. }
            | Self::TaskDeleted { task_id } => task_id,
        }
    }
}

/// Broadcast an event to every subscriber. Returns silently when nobody is
/// listening.
pub fn emit(tx: &broadcast::Sender<BoardEvent>, event: BoardEvent) {
    tracing::trace!(task_id = %event.task_id(), ?event, "board event");
    let _ = tx.send(event);
}

/// Serialize an event for the WebSocket and JSON-lines outputs.
pub fn to_json(event: &BoardEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize board event");
            None
        }
    }
}
