//! Status reconciler: the task state machine.
//!
//! Every input (progress event, plan snapshot, worker exit, user action) is
//! a pure function from the current `Arc<Task>` to the next one. Returning
//! the very same `Arc` means "nothing changed", which the store turns into
//! "no notification". Side effects the engine must carry out (spawning,
//! killing, forgetting contexts) come back as [`Effect`]s.
//!
//! Plan snapshots go through a fixed precedence, first match wins:
//!
//! 1. terminal task status: keep
//! 2. active execution phase: keep, the live worker is authoritative
//! 3. terminal execution phase: keep, settled until a user action
//! 4. plan status says human review: adopt it
//! 5. compute from subtask counts, then validate the result against the
//!    subtask list before committing it

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{
    ExecutionPhase, ExecutionProgress, Invocation, ReviewReason, SubtaskStatus, Task, TaskStatus,
    WorkerKind,
};
use super::orchestrator::ObservedExit;
use super::plan::{PlanSnapshot, SignoffStatus};
use super::progress::{GateDecision, ProgressClass, ProgressEvent, gate};
use crate::errors::BoardError;

/// Environment variable carrying reviewer feedback into a re-run.
pub const REVIEW_FEEDBACK_ENV: &str = "AGENTBOARD_REVIEW_FEEDBACK";

/// Explicit user intent. Always authoritative; bypasses the plan precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UserAction {
    Start,
    Stop,
    Approve,
    Reject {
        #[serde(default)]
        feedback: Option<String>,
    },
    Move {
        to: TaskStatus,
    },
    Delete,
    /// Return a stuck task to the backlog, optionally starting it again.
    Recover {
        #[serde(default)]
        restart: bool,
    },
    /// Run the QA pass against the current plan.
    Verify,
}

impl UserAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Approve => "approve",
            Self::Reject { .. } => "reject",
            Self::Move { .. } => "move",
            Self::Delete => "delete",
            Self::Recover { .. } => "recover",
            Self::Verify => "verify",
        }
    }
}

/// Work the engine performs on behalf of a transition, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Kill,
    /// Drop the execution context so the swap budget starts over.
    ResetContext,
    Spawn {
        invocation: Invocation,
        env: Vec<(String, String)>,
    },
    /// Remove the task from the board.
    Forget,
}

/// Result of an on-demand liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Liveness {
    /// Not expected to have a worker.
    Idle,
    Running,
    /// The worker reported a terminal phase.
    Settled,
    /// Status says running but no worker has been alive for longer than the
    /// grace period. Offered to the user as recoverable.
    Stuck { since: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Authority {
    /// Computed from worker output; never leaves a terminal status.
    Automatic,
    User,
}

fn assign(
    task: &mut Task,
    status: TaskStatus,
    reason: Option<ReviewReason>,
    authority: Authority,
) -> bool {
    if authority == Authority::Automatic && task.status.is_terminal() {
        tracing::debug!(task_id = %task.id, current = %task.status, refused = %status, "terminal status is not recomputed");
        return false;
    }
    let reason = if status == TaskStatus::HumanReview {
        reason
    } else {
        None
    };
    if task.status == status && task.review_reason == reason {
        return false;
    }
    tracing::info!(
        task_id = %task.id,
        from = %task.status,
        to = %status,
        reason = ?reason,
        "task status changed"
    );
    task.status = status;
    task.review_reason = reason;
    true
}

/// Commit `next` only if it differs from `task`; stamps `updated_at` on change.
fn commit(task: &Arc<Task>, mut next: Task) -> Arc<Task> {
    next.updated_at = task.updated_at;
    if next == **task {
        return Arc::clone(task);
    }
    next.updated_at = Utc::now();
    Arc::new(next)
}

pub struct StatusReconciler;

impl StatusReconciler {
    /// Apply a progress event behind the sequence gate.
    pub fn apply_progress(task: &Arc<Task>, event: &ProgressEvent) -> Arc<Task> {
        let class = match gate(&task.execution_progress, event) {
            GateDecision::Stale { stored, incoming } => {
                tracing::debug!(task_id = %task.id, stored, incoming, "dropping stale progress event");
                return Arc::clone(task);
            }
            GateDecision::Accept(class) => class,
        };

        let mut next = (**task).clone();
        next.execution_progress = ExecutionProgress {
            phase: event.phase,
            phase_progress: event.phase_progress,
            overall_progress: event.overall_progress,
            sequence_number: task
                .execution_progress
                .sequence_number
                .max(event.sequence_number),
        };
        if next == **task {
            return Arc::clone(task);
        }

        match class {
            ProgressClass::Tick => {
                // Percentage ticks don't bump updated_at.
                Arc::new(next)
            }
            ProgressClass::PhaseChange { from, to } => {
                tracing::debug!(task_id = %task.id, %from, %to, "execution phase changed");
                if to == ExecutionPhase::VerificationReview {
                    assign(&mut next, TaskStatus::AiReview, None, Authority::Automatic);
                }
                next.updated_at = Utc::now();
                Arc::new(next)
            }
        }
    }

    /// Merge a validated plan snapshot. Subtasks are always refreshed; the
    /// status follows the precedence in the module docs.
    pub fn apply_plan(task: &Arc<Task>, snapshot: &PlanSnapshot) -> Arc<Task> {
        let mut next = (**task).clone();
        next.subtasks = snapshot.subtasks.clone();

        if let Some((status, reason)) = Self::status_from_plan(task, snapshot) {
            assign(&mut next, status, reason, Authority::Automatic);
        }
        commit(task, next)
    }

    fn status_from_plan(
        task: &Task,
        snapshot: &PlanSnapshot,
    ) -> Option<(TaskStatus, Option<ReviewReason>)> {
        if task.status.is_terminal() {
            return None;
        }
        let phase = task.execution_progress.phase;
        if phase.is_active() || phase.is_terminal() {
            return None;
        }

        if snapshot.status == Some(TaskStatus::HumanReview) {
            return Some((TaskStatus::HumanReview, Some(attention_reason(snapshot))));
        }

        let computed = Self::compute_from_subtasks(task, snapshot)?;
        if !is_backed_by_subtasks(computed.0, snapshot) {
            tracing::debug!(
                task_id = %task.id,
                status = %computed.0,
                subtasks = snapshot.subtasks.len(),
                "discarding computed status not backed by the subtask list"
            );
            return None;
        }
        Some(computed)
    }

    fn compute_from_subtasks(
        task: &Task,
        snapshot: &PlanSnapshot,
    ) -> Option<(TaskStatus, Option<ReviewReason>)> {
        if snapshot.all_completed() {
            return Some(match snapshot.signoff {
                Some(SignoffStatus::Approved) => {
                    (TaskStatus::HumanReview, Some(ReviewReason::Completed))
                }
                Some(SignoffStatus::Rejected) => {
                    (TaskStatus::HumanReview, Some(ReviewReason::QaRejected))
                }
                _ if task.metadata.skip_ai_review => {
                    (TaskStatus::HumanReview, Some(ReviewReason::Completed))
                }
                _ if task.status == TaskStatus::HumanReview => return None,
                _ => (TaskStatus::AiReview, None),
            });
        }
        if snapshot.count(SubtaskStatus::Failed) > 0 {
            return Some((TaskStatus::HumanReview, Some(ReviewReason::Errors)));
        }
        let started = snapshot.count(SubtaskStatus::InProgress) + snapshot.count(SubtaskStatus::Completed);
        // Only a rejection moves a task out of review.
        if started > 0 && !task.status.is_review() {
            return Some((TaskStatus::InProgress, None));
        }
        None
    }

    /// Map an exit of the task's live worker to a status. Returns the next
    /// task and, for a successful definition run, the invocation to chain.
    pub fn apply_exit(
        task: &Arc<Task>,
        exit: &ObservedExit,
        signoff: Option<SignoffStatus>,
    ) -> (Arc<Task>, Option<Invocation>) {
        let mut next = (**task).clone();
        let mut follow_up = None;

        match exit.kind {
            WorkerKind::Execution | WorkerKind::Verification => {
                settle_phase(&mut next, exit.success());
                let reason = match (exit.success(), signoff) {
                    (true, Some(SignoffStatus::Rejected)) => ReviewReason::QaRejected,
                    (true, _) => ReviewReason::Completed,
                    (false, _) => ReviewReason::Errors,
                };
                assign(&mut next, TaskStatus::HumanReview, Some(reason), Authority::Automatic);
            }
            WorkerKind::DefinitionCreation if exit.success() => {
                if task.metadata.require_plan_review {
                    assign(
                        &mut next,
                        TaskStatus::HumanReview,
                        Some(ReviewReason::PlanReview),
                        Authority::Automatic,
                    );
                } else if !task.status.is_terminal() {
                    follow_up = Some(Invocation::execution_for(task));
                }
            }
            WorkerKind::DefinitionCreation => {
                settle_phase(&mut next, false);
                assign(&mut next, TaskStatus::Error, None, Authority::Automatic);
            }
        }

        (commit(task, next), follow_up)
    }

    /// Apply an explicit user action. `has_plan` tells `start` whether a plan
    /// already exists, in which case it goes straight to execution.
    pub fn apply_user_action(
        task: &Arc<Task>,
        action: &UserAction,
        has_plan: bool,
    ) -> Result<(Arc<Task>, Vec<Effect>), BoardError> {
        let mut next = (**task).clone();
        let mut effects = Vec::new();

        match action {
            UserAction::Start => start(&mut next, &mut effects, has_plan),
            UserAction::Stop => stop(&mut next, &mut effects),
            UserAction::Approve => match (task.status, task.review_reason) {
                (TaskStatus::HumanReview, Some(ReviewReason::PlanReview)) => {
                    assign(&mut next, TaskStatus::InProgress, None, Authority::User);
                    next.execution_progress = ExecutionProgress::idle();
                    effects.push(Effect::Spawn {
                        invocation: Invocation::execution_for(task),
                        env: Vec::new(),
                    });
                }
                (status, _) if status.is_review() => {
                    assign(&mut next, TaskStatus::Done, None, Authority::User);
                }
                (status, _) => return Err(invalid(action, status)),
            },
            UserAction::Reject { feedback } => {
                if !task.status.is_review() {
                    return Err(invalid(action, task.status));
                }
                assign(&mut next, TaskStatus::InProgress, None, Authority::User);
                next.execution_progress = ExecutionProgress::idle();
                let env = feedback
                    .iter()
                    .filter(|f| !f.trim().is_empty())
                    .map(|f| (REVIEW_FEEDBACK_ENV.to_string(), f.clone()))
                    .collect();
                effects.push(Effect::Spawn {
                    invocation: Invocation::execution_for(task),
                    env,
                });
            }
            UserAction::Move { to } => match to {
                TaskStatus::InProgress => start(&mut next, &mut effects, has_plan),
                TaskStatus::Backlog => stop(&mut next, &mut effects),
                status => {
                    if status.is_terminal() {
                        effects.push(Effect::Kill);
                    }
                    let reason = (*status == TaskStatus::HumanReview)
                        .then_some(task.review_reason)
                        .flatten();
                    assign(&mut next, *status, reason, Authority::User);
                }
            },
            UserAction::Delete => {
                effects.extend([Effect::Kill, Effect::ResetContext, Effect::Forget]);
                return Ok((Arc::clone(task), effects));
            }
            UserAction::Recover { restart } => {
                if *restart {
                    start(&mut next, &mut effects, has_plan);
                } else {
                    stop(&mut next, &mut effects);
                    effects.push(Effect::ResetContext);
                }
            }
            UserAction::Verify => {
                let runnable = matches!(task.status, TaskStatus::InProgress) || task.status.is_review();
                if !runnable || !(has_plan || !task.subtasks.is_empty()) {
                    return Err(invalid(action, task.status));
                }
                assign(&mut next, TaskStatus::AiReview, None, Authority::User);
                next.execution_progress = ExecutionProgress::idle();
                effects.extend([
                    Effect::ResetContext,
                    Effect::Spawn {
                        invocation: Invocation::verification_for(task),
                        env: Vec::new(),
                    },
                ]);
            }
        }

        tracing::info!(task_id = %task.id, action = action.name(), "user action applied");
        next.updated_at = Utc::now();
        Ok((Arc::new(next), effects))
    }

    /// A manual restart of a settled task puts it back in progress. Tasks
    /// whose worker is still mid-run keep their status and progress.
    pub fn apply_restart(task: &Arc<Task>) -> Arc<Task> {
        let settled = task.execution_progress.phase.is_terminal()
            || task.status.is_review()
            || task.status.is_terminal();
        if !settled {
            return Arc::clone(task);
        }
        let mut next = (**task).clone();
        assign(&mut next, TaskStatus::InProgress, None, Authority::User);
        next.execution_progress = ExecutionProgress::idle();
        commit(task, next)
    }

    /// Classify a task without touching it.
    pub fn liveness(
        task: &Task,
        worker_running: bool,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Liveness {
        if worker_running {
            return Liveness::Running;
        }
        if task.execution_progress.phase.is_terminal() {
            return Liveness::Settled;
        }
        if !matches!(task.status, TaskStatus::InProgress | TaskStatus::AiReview) {
            return Liveness::Idle;
        }
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::days(365));
        if now.signed_duration_since(task.updated_at) > grace {
            Liveness::Stuck {
                since: task.updated_at,
            }
        } else {
            Liveness::Running
        }
    }
}

fn start(next: &mut Task, effects: &mut Vec<Effect>, has_plan: bool) {
    assign(next, TaskStatus::InProgress, None, Authority::User);
    next.execution_progress = ExecutionProgress::idle();
    let invocation = if has_plan || !next.subtasks.is_empty() {
        Invocation::execution_for(next)
    } else {
        Invocation::definition_for(next)
    };
    effects.extend([
        Effect::ResetContext,
        Effect::Spawn {
            invocation,
            env: Vec::new(),
        },
    ]);
}

fn stop(next: &mut Task, effects: &mut Vec<Effect>) {
    effects.push(Effect::Kill);
    assign(next, TaskStatus::Backlog, None, Authority::User);
    next.execution_progress = ExecutionProgress::idle();
}

fn settle_phase(task: &mut Task, success: bool) {
    let progress = &mut task.execution_progress;
    progress.phase = if success {
        ExecutionPhase::Complete
    } else {
        ExecutionPhase::Failed
    };
    if success {
        progress.phase_progress = 100;
        progress.overall_progress = 100;
    }
}

fn attention_reason(snapshot: &PlanSnapshot) -> ReviewReason {
    if snapshot.subtasks.is_empty() {
        ReviewReason::PlanReview
    } else if snapshot.count(SubtaskStatus::Failed) > 0 {
        ReviewReason::Errors
    } else if snapshot.signoff == Some(SignoffStatus::Rejected) {
        ReviewReason::QaRejected
    } else {
        ReviewReason::Completed
    }
}

fn is_backed_by_subtasks(status: TaskStatus, snapshot: &PlanSnapshot) -> bool {
    if status.requires_subtasks() && snapshot.subtasks.is_empty() {
        return false;
    }
    if status.requires_all_completed() && !snapshot.all_completed() {
        return false;
    }
    true
}

fn invalid(action: &UserAction, status: TaskStatus) -> BoardError {
    BoardError::InvalidAction {
        action: action.name().to_string(),
        status: status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::models::{NewTask, Subtask, TaskMetadata};
    use std::path::PathBuf;

    fn task() -> Arc<Task> {
        Arc::new(Task::new(NewTask {
            id: Some("t1".to_string()),
            spec_id: Some("001-auth".to_string()),
            title: "Auth".to_string(),
            description: "Add auth".to_string(),
            work_dir: PathBuf::from("/tmp/project"),
            ..Default::default()
        }))
    }

    fn with(task: &Arc<Task>, f: impl FnOnce(&mut Task)) -> Arc<Task> {
        let mut next = (**task).clone();
        f(&mut next);
        Arc::new(next)
    }

    fn running(phase: ExecutionPhase) -> Arc<Task> {
        with(&task(), |t| {
            t.status = TaskStatus::InProgress;
            t.execution_progress.phase = phase;
        })
    }

    fn subtasks(statuses: &[SubtaskStatus]) -> Vec<Subtask> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| Subtask {
                id: format!("{}", i + 1),
                description: format!("Subtask {}", i + 1),
                status: *status,
            })
            .collect()
    }

    fn snapshot(statuses: &[SubtaskStatus]) -> PlanSnapshot {
        PlanSnapshot {
            subtasks: subtasks(statuses),
            status: None,
            signoff: None,
        }
    }

    fn progress(phase: ExecutionPhase, seq: u64) -> ProgressEvent {
        ProgressEvent::new(phase, seq)
    }

    use SubtaskStatus::{Completed, Failed, InProgress, Pending};

    // ── Progress ────────────────────────────────────────────────────

    #[test]
    fn test_sequence_monotonicity() {
        let mut t = running(ExecutionPhase::Idle);
        for seq in [5, 3, 7] {
            t = StatusReconciler::apply_progress(&t, &progress(ExecutionPhase::Coding, seq));
        }
        assert_eq!(t.execution_progress.sequence_number, 7);

        let at_five = StatusReconciler::apply_progress(
            &running(ExecutionPhase::Idle),
            &progress(ExecutionPhase::Coding, 5),
        );
        let after_three =
            StatusReconciler::apply_progress(&at_five, &progress(ExecutionPhase::Planning, 3));
        assert!(Arc::ptr_eq(&at_five, &after_three), "stale event must have no effect");
    }

    #[test]
    fn test_tick_does_not_touch_updated_at() {
        let t = StatusReconciler::apply_progress(
            &running(ExecutionPhase::Idle),
            &progress(ExecutionPhase::Coding, 1),
        );
        let stamped = t.updated_at;
        let mut tick = progress(ExecutionPhase::Coding, 2);
        tick.overall_progress = 50;
        let after = StatusReconciler::apply_progress(&t, &tick);
        assert_eq!(after.execution_progress.overall_progress, 50);
        assert_eq!(after.updated_at, stamped);
    }

    #[test]
    fn test_identical_progress_is_noop() {
        let t = StatusReconciler::apply_progress(
            &running(ExecutionPhase::Idle),
            &progress(ExecutionPhase::Coding, 4),
        );
        let again = StatusReconciler::apply_progress(&t, &progress(ExecutionPhase::Coding, 4));
        assert!(Arc::ptr_eq(&t, &again));
    }

    #[test]
    fn test_verification_review_pushes_ai_review() {
        let t = StatusReconciler::apply_progress(
            &running(ExecutionPhase::Coding),
            &progress(ExecutionPhase::VerificationReview, 4),
        );
        assert_eq!(t.status, TaskStatus::AiReview);
    }

    #[test]
    fn test_verification_review_never_leaves_terminal_status() {
        let done = with(&running(ExecutionPhase::Coding), |t| t.status = TaskStatus::Done);
        let t = StatusReconciler::apply_progress(
            &done,
            &progress(ExecutionPhase::VerificationReview, 4),
        );
        assert_eq!(t.status, TaskStatus::Done);
        assert_eq!(t.execution_progress.phase, ExecutionPhase::VerificationReview);
    }

    // ── Plan snapshots ──────────────────────────────────────────────

    #[test]
    fn test_terminal_immutability() {
        let done = with(&task(), |t| t.status = TaskStatus::Done);
        let t = StatusReconciler::apply_plan(&done, &snapshot(&[Failed, Failed]));
        assert_eq!(t.status, TaskStatus::Done);
        assert_eq!(t.subtasks.len(), 2);
    }

    #[test]
    fn test_empty_subtasks_never_complete_a_task() {
        let t = running(ExecutionPhase::Idle);
        let claims_done = PlanSnapshot {
            subtasks: Vec::new(),
            status: Some(TaskStatus::Done),
            signoff: Some(SignoffStatus::Approved),
        };
        let after = StatusReconciler::apply_plan(&t, &claims_done);
        assert_eq!(after.status, TaskStatus::InProgress);
        assert!(!matches!(
            after.status,
            TaskStatus::AiReview | TaskStatus::Done | TaskStatus::PrCreated
        ));
    }

    #[test]
    fn test_active_phase_override() {
        let t = running(ExecutionPhase::Coding);
        let after = StatusReconciler::apply_plan(&t, &snapshot(&[Completed, Completed]));
        assert_eq!(after.status, TaskStatus::InProgress);
        assert_eq!(after.completed_subtasks(), 2);
    }

    #[test]
    fn test_terminal_phase_holds_status() {
        let t = running(ExecutionPhase::Failed);
        let after = StatusReconciler::apply_plan(&t, &snapshot(&[Completed, Completed]));
        assert_eq!(after.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_idempotent_reapplication() {
        let t = running(ExecutionPhase::Idle);
        let plan = snapshot(&[Completed, InProgress]);
        let once = StatusReconciler::apply_plan(&t, &plan);
        let twice = StatusReconciler::apply_plan(&once, &plan);
        assert!(Arc::ptr_eq(&once, &twice));
        assert_eq!(*once, *twice);
    }

    #[test]
    fn test_all_completed_goes_to_ai_review() {
        let after = StatusReconciler::apply_plan(
            &running(ExecutionPhase::Idle),
            &snapshot(&[Completed, Completed]),
        );
        assert_eq!(after.status, TaskStatus::AiReview);
        assert_eq!(after.review_reason, None);
    }

    #[test]
    fn test_all_completed_skipping_ai_review() {
        let t = with(&running(ExecutionPhase::Idle), |t| {
            t.metadata = TaskMetadata {
                skip_ai_review: true,
                ..Default::default()
            }
        });
        let after = StatusReconciler::apply_plan(&t, &snapshot(&[Completed]));
        assert_eq!(after.status, TaskStatus::HumanReview);
        assert_eq!(after.review_reason, Some(ReviewReason::Completed));
    }

    #[test]
    fn test_all_completed_with_signoff() {
        let mut plan = snapshot(&[Completed]);
        plan.signoff = Some(SignoffStatus::Rejected);
        let after = StatusReconciler::apply_plan(&running(ExecutionPhase::Idle), &plan);
        assert_eq!(after.review_reason, Some(ReviewReason::QaRejected));

        plan.signoff = Some(SignoffStatus::Approved);
        let after = StatusReconciler::apply_plan(&running(ExecutionPhase::Idle), &plan);
        assert_eq!(after.status, TaskStatus::HumanReview);
        assert_eq!(after.review_reason, Some(ReviewReason::Completed));
    }

    #[test]
    fn test_failed_subtask_needs_human() {
        let after = StatusReconciler::apply_plan(
            &running(ExecutionPhase::Idle),
            &snapshot(&[Completed, Failed, Pending]),
        );
        assert_eq!(after.status, TaskStatus::HumanReview);
        assert_eq!(after.review_reason, Some(ReviewReason::Errors));
    }

    #[test]
    fn test_started_subtasks_mean_in_progress() {
        let after = StatusReconciler::apply_plan(&task(), &snapshot(&[Completed, Pending]));
        assert_eq!(after.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_nothing_started_keeps_status() {
        let t = task();
        let after = StatusReconciler::apply_plan(&t, &snapshot(&[Pending, Pending]));
        assert_eq!(after.status, TaskStatus::Backlog);
        assert_eq!(after.subtasks.len(), 2);
    }

    #[test]
    fn test_review_is_not_pulled_back_to_in_progress() {
        let t = with(&task(), |t| {
            t.status = TaskStatus::HumanReview;
            t.review_reason = Some(ReviewReason::Completed);
        });
        let after = StatusReconciler::apply_plan(&t, &snapshot(&[Completed, InProgress]));
        assert_eq!(after.status, TaskStatus::HumanReview);
        assert_eq!(after.review_reason, Some(ReviewReason::Completed));
    }

    #[test]
    fn test_explicit_human_review_is_adopted_without_subtasks() {
        let plan = PlanSnapshot {
            subtasks: Vec::new(),
            status: Some(TaskStatus::HumanReview),
            signoff: None,
        };
        let after = StatusReconciler::apply_plan(&running(ExecutionPhase::Idle), &plan);
        assert_eq!(after.status, TaskStatus::HumanReview);
        assert_eq!(after.review_reason, Some(ReviewReason::PlanReview));
    }

    #[test]
    fn test_explicit_human_review_with_partial_progress() {
        let plan = PlanSnapshot {
            subtasks: subtasks(&[Completed, Pending]),
            status: Some(TaskStatus::HumanReview),
            signoff: None,
        };
        let after = StatusReconciler::apply_plan(&running(ExecutionPhase::Idle), &plan);
        assert_eq!(after.status, TaskStatus::HumanReview);
        assert_eq!(after.review_reason, Some(ReviewReason::Completed));
    }

    #[test]
    fn test_explicit_human_review_waits_for_active_phase() {
        let plan = PlanSnapshot {
            subtasks: subtasks(&[Completed]),
            status: Some(TaskStatus::HumanReview),
            signoff: None,
        };
        let after = StatusReconciler::apply_plan(&running(ExecutionPhase::Planning), &plan);
        assert_eq!(after.status, TaskStatus::InProgress);
    }

    // ── Exits ───────────────────────────────────────────────────────

    fn exit(kind: WorkerKind, code: i32) -> ObservedExit {
        ObservedExit {
            kind,
            code: Some(code),
            restart_requested: false,
        }
    }

    #[test]
    fn test_execution_exit_lands_in_human_review() {
        let (ok, follow) = StatusReconciler::apply_exit(
            &running(ExecutionPhase::Coding),
            &exit(WorkerKind::Execution, 0),
            None,
        );
        assert_eq!(ok.status, TaskStatus::HumanReview);
        assert_eq!(ok.review_reason, Some(ReviewReason::Completed));
        assert_eq!(ok.execution_progress.phase, ExecutionPhase::Complete);
        assert!(follow.is_none());

        let (failed, _) = StatusReconciler::apply_exit(
            &running(ExecutionPhase::Coding),
            &exit(WorkerKind::Verification, 2),
            None,
        );
        assert_eq!(failed.status, TaskStatus::HumanReview);
        assert_eq!(failed.review_reason, Some(ReviewReason::Errors));
        assert_eq!(failed.execution_progress.phase, ExecutionPhase::Failed);
    }

    #[test]
    fn test_execution_exit_with_rejected_signoff() {
        let (t, _) = StatusReconciler::apply_exit(
            &running(ExecutionPhase::VerificationReview),
            &exit(WorkerKind::Execution, 0),
            Some(SignoffStatus::Rejected),
        );
        assert_eq!(t.review_reason, Some(ReviewReason::QaRejected));
    }

    #[test]
    fn test_exit_never_leaves_terminal_status() {
        let done = with(&running(ExecutionPhase::Coding), |t| t.status = TaskStatus::Done);
        let (t, _) = StatusReconciler::apply_exit(&done, &exit(WorkerKind::Execution, 1), None);
        assert_eq!(t.status, TaskStatus::Done);
    }

    #[test]
    fn test_definition_success_chains_into_execution() {
        let (t, follow) = StatusReconciler::apply_exit(
            &running(ExecutionPhase::Planning),
            &exit(WorkerKind::DefinitionCreation, 0),
            None,
        );
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(follow.map(|i| i.kind()), Some(WorkerKind::Execution));
    }

    #[test]
    fn test_definition_success_waits_for_plan_review() {
        let t = with(&running(ExecutionPhase::Planning), |t| {
            t.metadata.require_plan_review = true
        });
        let (t, follow) =
            StatusReconciler::apply_exit(&t, &exit(WorkerKind::DefinitionCreation, 0), None);
        assert_eq!(t.status, TaskStatus::HumanReview);
        assert_eq!(t.review_reason, Some(ReviewReason::PlanReview));
        assert!(follow.is_none());
    }

    #[test]
    fn test_definition_failure_is_an_error() {
        let (t, follow) = StatusReconciler::apply_exit(
            &running(ExecutionPhase::Planning),
            &exit(WorkerKind::DefinitionCreation, 1),
            None,
        );
        assert_eq!(t.status, TaskStatus::Error);
        assert!(follow.is_none());
    }

    // ── User actions ────────────────────────────────────────────────

    #[test]
    fn test_start_without_plan_creates_definition() {
        let (t, effects) =
            StatusReconciler::apply_user_action(&task(), &UserAction::Start, false).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(effects[0], Effect::ResetContext);
        match &effects[1] {
            Effect::Spawn { invocation, .. } => {
                assert_eq!(invocation.kind(), WorkerKind::DefinitionCreation)
            }
            other => panic!("Expected spawn, got {:?}", other),
        }
    }

    #[test]
    fn test_start_with_plan_executes() {
        let (_, effects) =
            StatusReconciler::apply_user_action(&task(), &UserAction::Start, true).unwrap();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Spawn { invocation, .. } if invocation.kind() == WorkerKind::Execution
        )));
    }

    #[test]
    fn test_start_leaves_terminal_status() {
        let errored = with(&task(), |t| t.status = TaskStatus::Error);
        let (t, _) =
            StatusReconciler::apply_user_action(&errored, &UserAction::Start, true).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_stop_resets_progress() {
        let t = with(&running(ExecutionPhase::Coding), |t| {
            t.execution_progress.sequence_number = 12
        });
        let (t, effects) =
            StatusReconciler::apply_user_action(&t, &UserAction::Stop, false).unwrap();
        assert_eq!(t.status, TaskStatus::Backlog);
        assert_eq!(t.execution_progress, ExecutionProgress::idle());
        assert_eq!(effects, vec![Effect::Kill]);
    }

    #[test]
    fn test_approve_plan_review_starts_execution() {
        let t = with(&task(), |t| {
            t.status = TaskStatus::HumanReview;
            t.review_reason = Some(ReviewReason::PlanReview);
        });
        let (t, effects) =
            StatusReconciler::apply_user_action(&t, &UserAction::Approve, true).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(t.review_reason, None);
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn test_approve_review_completes() {
        let t = with(&task(), |t| {
            t.status = TaskStatus::HumanReview;
            t.review_reason = Some(ReviewReason::Completed);
        });
        let (t, effects) =
            StatusReconciler::apply_user_action(&t, &UserAction::Approve, true).unwrap();
        assert_eq!(t.status, TaskStatus::Done);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_approve_outside_review_is_invalid() {
        let err = StatusReconciler::apply_user_action(&task(), &UserAction::Approve, true)
            .unwrap_err();
        assert!(matches!(err, BoardError::InvalidAction { .. }));
    }

    #[test]
    fn test_reject_passes_feedback() {
        let t = with(&task(), |t| {
            t.status = TaskStatus::HumanReview;
            t.review_reason = Some(ReviewReason::Completed);
            t.execution_progress.phase = ExecutionPhase::Complete;
        });
        let action = UserAction::Reject {
            feedback: Some("Tests are missing".to_string()),
        };
        let (t, effects) = StatusReconciler::apply_user_action(&t, &action, true).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(t.execution_progress.phase, ExecutionPhase::Idle);
        match &effects[0] {
            Effect::Spawn { env, .. } => assert_eq!(
                env,
                &vec![(REVIEW_FEEDBACK_ENV.to_string(), "Tests are missing".to_string())]
            ),
            other => panic!("Expected spawn, got {:?}", other),
        }
    }

    #[test]
    fn test_move_to_terminal_kills_worker() {
        let (t, effects) = StatusReconciler::apply_user_action(
            &running(ExecutionPhase::Coding),
            &UserAction::Move {
                to: TaskStatus::PrCreated,
            },
            true,
        )
        .unwrap();
        assert_eq!(t.status, TaskStatus::PrCreated);
        assert_eq!(effects, vec![Effect::Kill]);
    }

    #[test]
    fn test_delete_effects() {
        let t = task();
        let (same, effects) =
            StatusReconciler::apply_user_action(&t, &UserAction::Delete, false).unwrap();
        assert!(Arc::ptr_eq(&t, &same));
        assert_eq!(effects, vec![Effect::Kill, Effect::ResetContext, Effect::Forget]);
    }

    #[test]
    fn test_recover_returns_to_backlog() {
        let (t, effects) = StatusReconciler::apply_user_action(
            &running(ExecutionPhase::Coding),
            &UserAction::Recover { restart: false },
            true,
        )
        .unwrap();
        assert_eq!(t.status, TaskStatus::Backlog);
        assert_eq!(effects, vec![Effect::Kill, Effect::ResetContext]);
    }

    #[test]
    fn test_user_action_json_shape() {
        let action: UserAction =
            serde_json::from_str(r#"{"action": "move", "to": "human_review"}"#).unwrap();
        assert_eq!(
            action,
            UserAction::Move {
                to: TaskStatus::HumanReview
            }
        );
        let action: UserAction = serde_json::from_str(r#"{"action": "reject"}"#).unwrap();
        assert_eq!(action, UserAction::Reject { feedback: None });
        let action: UserAction = serde_json::from_str(r#"{"action": "verify"}"#).unwrap();
        assert_eq!(action, UserAction::Verify);
    }

    #[test]
    fn test_verify_spawns_qa_pass_from_review() {
        let t = with(&task(), |t| {
            t.status = TaskStatus::HumanReview;
            t.review_reason = Some(ReviewReason::Completed);
            t.subtasks = subtasks(&[Completed]);
            t.execution_progress.phase = ExecutionPhase::Complete;
        });
        let (t, effects) =
            StatusReconciler::apply_user_action(&t, &UserAction::Verify, true).unwrap();
        assert_eq!(t.status, TaskStatus::AiReview);
        assert_eq!(t.review_reason, None);
        assert_eq!(t.execution_progress, ExecutionProgress::idle());
        match &effects[..] {
            [Effect::ResetContext, Effect::Spawn { invocation, env }] => {
                assert_eq!(invocation.kind(), WorkerKind::Verification);
                assert!(env.is_empty());
            }
            other => panic!("Expected reset then spawn, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_needs_a_plan_and_a_live_column() {
        let err = StatusReconciler::apply_user_action(&task(), &UserAction::Verify, true)
            .unwrap_err();
        assert!(matches!(err, BoardError::InvalidAction { .. }));

        let no_plan = with(&task(), |t| t.status = TaskStatus::InProgress);
        assert!(StatusReconciler::apply_user_action(&no_plan, &UserAction::Verify, false).is_err());

        let done = with(&task(), |t| {
            t.status = TaskStatus::Done;
            t.subtasks = subtasks(&[Completed]);
        });
        assert!(StatusReconciler::apply_user_action(&done, &UserAction::Verify, true).is_err());
    }

    #[test]
    fn test_verification_exit_lands_in_human_review() {
        let t = with(&task(), |t| {
            t.status = TaskStatus::AiReview;
            t.subtasks = subtasks(&[Completed]);
        });
        let (t, follow_up) = StatusReconciler::apply_exit(
            &t,
            &exit(WorkerKind::Verification, 0),
            Some(SignoffStatus::Approved),
        );
        assert!(follow_up.is_none());
        assert_eq!(t.status, TaskStatus::HumanReview);
        assert_eq!(t.review_reason, Some(ReviewReason::Completed));
        assert_eq!(t.execution_progress.phase, ExecutionPhase::Complete);
    }

    #[test]
    fn test_restart_reopens_settled_task() {
        let t = with(&task(), |t| {
            t.status = TaskStatus::HumanReview;
            t.review_reason = Some(ReviewReason::Errors);
            t.execution_progress.phase = ExecutionPhase::Failed;
        });
        let next = StatusReconciler::apply_restart(&t);
        assert_eq!(next.status, TaskStatus::InProgress);
        assert_eq!(next.review_reason, None);
        assert_eq!(next.execution_progress, ExecutionProgress::idle());
    }

    #[test]
    fn test_restart_leaves_running_task_alone() {
        let t = running(ExecutionPhase::Coding);
        assert!(Arc::ptr_eq(&t, &StatusReconciler::apply_restart(&t)));
    }

    // ── Liveness ────────────────────────────────────────────────────

    #[test]
    fn test_liveness() {
        let grace = Duration::from_secs(30);
        let now = Utc::now();
        let stale = with(&running(ExecutionPhase::Coding), |t| {
            t.updated_at = now - chrono::Duration::seconds(120)
        });

        assert_eq!(
            StatusReconciler::liveness(&stale, true, grace, now),
            Liveness::Running
        );
        assert_eq!(
            StatusReconciler::liveness(&stale, false, grace, now),
            Liveness::Stuck {
                since: stale.updated_at
            }
        );
        let fresh = with(&stale, |t| t.updated_at = now);
        assert_eq!(
            StatusReconciler::liveness(&fresh, false, grace, now),
            Liveness::Running
        );
        let settled = with(&stale, |t| t.execution_progress.phase = ExecutionPhase::Complete);
        assert_eq!(
            StatusReconciler::liveness(&settled, false, grace, now),
            Liveness::Settled
        );
        assert_eq!(
            StatusReconciler::liveness(&task(), false, grace, now),
            Liveness::Idle
        );
    }

    // ── End to end ──────────────────────────────────────────────────

    #[test]
    fn test_backlog_to_human_review_scenario() {
        let t = task();
        assert_eq!(t.status, TaskStatus::Backlog);

        let (t, _) = StatusReconciler::apply_user_action(&t, &UserAction::Start, true).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);

        let t = StatusReconciler::apply_progress(&t, &progress(ExecutionPhase::Planning, 1));
        assert_eq!(t.execution_progress.phase, ExecutionPhase::Planning);
        assert_eq!(t.status, TaskStatus::InProgress);

        let t = StatusReconciler::apply_progress(
            &t,
            &progress(ExecutionPhase::VerificationReview, 4),
        );
        assert_eq!(t.status, TaskStatus::AiReview);

        let (t, _) = StatusReconciler::apply_exit(
            &t,
            &exit(WorkerKind::Execution, 0),
            Some(SignoffStatus::Approved),
        );
        assert_eq!(t.status, TaskStatus::HumanReview);
        assert_eq!(t.review_reason, Some(ReviewReason::Completed));
    }
}
