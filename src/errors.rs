//! Typed error hierarchy for agentboard.
//!
//! Three top-level enums cover the three subsystems:
//! - `OrchestratorError` — worker configuration and spawn failures
//! - `PlanError` — plan documents that cannot be read or fail validation
//! - `BoardError` — task lookup and engine lifecycle failures

use thiserror::Error;

/// Errors from the process orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Worker {what} is not configured")]
    NotConfigured { what: &'static str },

    #[error("Worker {what} not found at {path}")]
    ToolMissing {
        what: &'static str,
        path: std::path::PathBuf,
    },

    #[error("Failed to spawn worker process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Invocation is missing required field '{0}'")]
    InvalidInvocation(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from parsing or validating a plan document.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Plan document has no phases array")]
    MissingPhases,

    #[error("Phase {phase} has no subtasks array")]
    MissingSubtasks { phase: usize },

    #[error("Subtask {index} in phase {phase} is missing its {field}")]
    IncompleteSubtask {
        phase: usize,
        index: usize,
        field: &'static str,
    },
}

/// Errors surfaced by the board engine to its callers.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Task {key} not found")]
    TaskNotFound { key: String },

    #[error("Task {id} already exists")]
    DuplicateTask { id: String },

    #[error("Action '{action}' is not allowed while task is {status}")]
    InvalidAction { action: String, status: String },

    #[error("Board engine has shut down")]
    EngineClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
