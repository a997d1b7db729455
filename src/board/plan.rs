//! Plan documents written by the worker.
//!
//! The worker rewrites `implementation_plan.json` in place with no locking, so
//! any read may observe a half-written file. A `PlanDocument` is the raw shape
//! as parsed; `validate()` turns it into a `PlanSnapshot` or rejects it whole.

use serde::{Deserialize, Serialize};

use super::models::{Subtask, SubtaskStatus, TaskStatus};
use crate::errors::PlanError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<PlanPhase>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qa_signoff: Option<QaSignoff>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "chunks", skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<PlanSubtask>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSubtask {
    /// Workers write both numeric and string ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaSignoff {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignoffStatus {
    Approved,
    Rejected,
    Pending,
}

/// A plan document that passed structural validation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanSnapshot {
    pub subtasks: Vec<Subtask>,
    /// The author's last explicit status, mapped through [`map_plan_status`].
    pub status: Option<TaskStatus>,
    pub signoff: Option<SignoffStatus>,
}

impl PlanSnapshot {
    pub fn count(&self, status: SubtaskStatus) -> usize {
        self.subtasks.iter().filter(|s| s.status == status).count()
    }

    pub fn all_completed(&self) -> bool {
        !self.subtasks.is_empty() && self.count(SubtaskStatus::Completed) == self.subtasks.len()
    }
}

impl PlanDocument {
    pub fn parse(content: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Structural validation. Any missing piece rejects the whole document;
    /// a snapshot is never partially applied.
    pub fn validate(&self) -> Result<PlanSnapshot, PlanError> {
        let phases = self.phases.as_ref().ok_or(PlanError::MissingPhases)?;

        let mut subtasks = Vec::new();
        for (phase_idx, phase) in phases.iter().enumerate() {
            let entries = phase
                .subtasks
                .as_ref()
                .ok_or(PlanError::MissingSubtasks { phase: phase_idx })?;
            for (index, entry) in entries.iter().enumerate() {
                let id = entry
                    .id
                    .as_ref()
                    .and_then(id_to_string)
                    .ok_or(PlanError::IncompleteSubtask {
                        phase: phase_idx,
                        index,
                        field: "id",
                    })?;
                let description = entry
                    .description
                    .as_deref()
                    .filter(|d| !d.trim().is_empty())
                    .ok_or(PlanError::IncompleteSubtask {
                        phase: phase_idx,
                        index,
                        field: "description",
                    })?;
                subtasks.push(Subtask {
                    id,
                    description: description.to_string(),
                    status: entry
                        .status
                        .as_deref()
                        .map(SubtaskStatus::from_plan)
                        .unwrap_or_default(),
                });
            }
        }

        Ok(PlanSnapshot {
            subtasks,
            status: self.status.as_deref().and_then(map_plan_status),
            signoff: self
                .qa_signoff
                .as_ref()
                .and_then(|s| s.status.as_deref())
                .map(map_signoff_status),
        })
    }
}

fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Fixed lookup table from the free-form plan `status` to a board status.
pub fn map_plan_status(raw: &str) -> Option<TaskStatus> {
    let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "backlog" | "pending" | "not_started" => Some(TaskStatus::Backlog),
        "in_progress" | "planning" | "coding" | "running" => Some(TaskStatus::InProgress),
        "ai_review" | "review" | "qa" | "qa_review" => Some(TaskStatus::AiReview),
        "human_review" | "needs_review" | "awaiting_review" | "needs_attention" => {
            Some(TaskStatus::HumanReview)
        }
        "done" | "completed" | "complete" => Some(TaskStatus::Done),
        "pr_created" => Some(TaskStatus::PrCreated),
        "error" | "failed" => Some(TaskStatus::Error),
        _ => None,
    }
}

fn map_signoff_status(raw: &str) -> SignoffStatus {
    match raw.trim().to_lowercase().as_str() {
        "approved" => SignoffStatus::Approved,
        "rejected" => SignoffStatus::Rejected,
        _ => SignoffStatus::Pending,
    }
}
