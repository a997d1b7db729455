use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column a task sits in on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    AiReview,
    HumanReview,
    Done,
    PrCreated,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::AiReview => "ai_review",
            Self::HumanReview => "human_review",
            Self::Done => "done",
            Self::PrCreated => "pr_created",
            Self::Error => "error",
        }
    }

    /// Terminal statuses are only ever left through an explicit user action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::PrCreated | Self::Error)
    }

    /// Statuses that must be backed by a validated subtask list before a
    /// computed transition may land on them.
    pub fn requires_subtasks(&self) -> bool {
        matches!(
            self,
            Self::AiReview | Self::HumanReview | Self::Done | Self::PrCreated
        )
    }

    /// Statuses that additionally require every subtask to be completed.
    pub fn requires_all_completed(&self) -> bool {
        matches!(self, Self::AiReview | Self::Done | Self::PrCreated)
    }

    pub fn is_review(&self) -> bool {
        matches!(self, Self::AiReview | Self::HumanReview)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "in_progress" => Ok(Self::InProgress),
            "ai_review" => Ok(Self::AiReview),
            "human_review" => Ok(Self::HumanReview),
            "done" => Ok(Self::Done),
            "pr_created" => Ok(Self::PrCreated),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Why a task is waiting in `human_review`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    Completed,
    Errors,
    QaRejected,
    PlanReview,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Errors => "errors",
            Self::QaRejected => "qa_rejected",
            Self::PlanReview => "plan_review",
        }
    }
}

impl std::fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "errors" => Ok(Self::Errors),
            "qa_rejected" => Ok(Self::QaRejected),
            "plan_review" => Ok(Self::PlanReview),
            _ => Err(format!("Invalid review reason: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Lenient mapping used for plan documents, which are written by the
    /// worker and may carry statuses this board does not know about.
    pub fn from_plan(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid subtask status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub status: SubtaskStatus,
}

/// Execution phase reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    #[default]
    Idle,
    Planning,
    Coding,
    #[serde(alias = "qa_review", alias = "verification-review")]
    VerificationReview,
    #[serde(alias = "qa_fixing", alias = "verification-fix")]
    VerificationFix,
    Complete,
    Failed,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::VerificationReview => "verification_review",
            Self::VerificationFix => "verification_fix",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// A live worker owns the status while it is in one of these phases.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Planning | Self::Coding | Self::VerificationReview | Self::VerificationFix
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub phase: ExecutionPhase,
    pub phase_progress: u8,
    pub overall_progress: u8,
    pub sequence_number: u64,
}

impl ExecutionProgress {
    /// Baseline a task returns to when it is started or stopped.
    pub fn idle() -> Self {
        Self::default()
    }
}

/// Per-task switches carried from wherever the task was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Completed plans go straight to human review.
    #[serde(default)]
    pub skip_ai_review: bool,
    /// Stop after the definition worker so a human can approve the plan.
    #[serde(default)]
    pub require_plan_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub spec_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub review_reason: Option<ReviewReason>,
    pub subtasks: Vec<Subtask>,
    pub execution_progress: ExecutionProgress,
    pub work_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(new: NewTask) -> Self {
        let id = new
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let spec_id = new.spec_id.unwrap_or_else(|| id.clone());
        let now = Utc::now();
        Self {
            id,
            spec_id,
            title: new.title,
            description: new.description,
            status: TaskStatus::Backlog,
            review_reason: None,
            subtasks: Vec::new(),
            execution_progress: ExecutionProgress::idle(),
            work_dir: new.work_dir,
            plan_path: new.plan_path,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn matches_key(&self, key: &str) -> bool {
        self.id == key || self.spec_id == key
    }

    pub fn completed_subtasks(&self) -> usize {
        self.subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .count()
    }
}

/// Request payload for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub spec_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub plan_path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

/// What a worker process is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    DefinitionCreation,
    Execution,
    Verification,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefinitionCreation => "definition_creation",
            Self::Execution => "execution",
            Self::Verification => "verification",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "definition_creation" => Ok(Self::DefinitionCreation),
            "execution" => Ok(Self::Execution),
            "verification" => Ok(Self::Verification),
            _ => Err(format!("Invalid worker kind: {}", s)),
        }
    }
}

/// Arguments for one worker invocation, per kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Invocation {
    DefinitionCreation {
        work_item_description: String,
        work_dir: PathBuf,
        #[serde(default)]
        plan_dir_override: Option<PathBuf>,
        #[serde(default)]
        auto_approve: bool,
    },
    Execution {
        spec_id: String,
        work_dir: PathBuf,
        auto_continue: bool,
        force: bool,
        #[serde(default)]
        base_branch: Option<String>,
    },
    Verification {
        spec_id: String,
        work_dir: PathBuf,
    },
}

impl Invocation {
    pub fn kind(&self) -> WorkerKind {
        match self {
            Self::DefinitionCreation { .. } => WorkerKind::DefinitionCreation,
            Self::Execution { .. } => WorkerKind::Execution,
            Self::Verification { .. } => WorkerKind::Verification,
        }
    }

    pub fn work_dir(&self) -> &std::path::Path {
        match self {
            Self::DefinitionCreation { work_dir, .. }
            | Self::Execution { work_dir, .. }
            | Self::Verification { work_dir, .. } => work_dir,
        }
    }

    /// Execution invocation for a task, the default next step after a plan exists.
    pub fn execution_for(task: &Task) -> Self {
        Self::Execution {
            spec_id: task.spec_id.clone(),
            work_dir: task.work_dir.clone(),
            auto_continue: true,
            force: true,
            base_branch: task.metadata.base_branch.clone(),
        }
    }

    pub fn definition_for(task: &Task) -> Self {
        Self::DefinitionCreation {
            work_item_description: if task.description.is_empty() {
                task.title.clone()
            } else {
                task.description.clone()
            },
            work_dir: task.work_dir.clone(),
            plan_dir_override: None,
            auto_approve: !task.metadata.require_plan_review,
        }
    }

    pub fn verification_for(task: &Task) -> Self {
        Self::Verification {
            spec_id: task.spec_id.clone(),
            work_dir: task.work_dir.clone(),
        }
    }
}
