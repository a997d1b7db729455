//! Headless single-task run — `agentboard run`.
//!
//! Creates one task, starts it and prints every event for it as a JSON line
//! on stdout until the task lands in human review or a terminal status.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use agentboard::board::events::to_json;
use agentboard::board::models::{NewTask, ReviewReason, TaskMetadata, TaskStatus};
use agentboard::board::{Board, BoardEvent, UserAction};

use super::super::Cli;
use super::{init_logging, load_config};

pub struct RunArgs {
    pub spec_id: String,
    pub work_dir: Option<PathBuf>,
    pub description: Option<String>,
    pub title: Option<String>,
    pub require_plan_review: bool,
    pub skip_ai_review: bool,
}

/// Where a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    pub status: TaskStatus,
    pub review_reason: Option<ReviewReason>,
}

impl Settled {
    pub fn is_failure(&self) -> bool {
        self.status == TaskStatus::Error
            || matches!(
                self.review_reason,
                Some(ReviewReason::Errors | ReviewReason::QaRejected)
            )
    }
}

/// A status change that ends a headless run.
pub fn settled(event: &BoardEvent) -> Option<Settled> {
    match event {
        BoardEvent::StatusChanged {
            status,
            review_reason,
            ..
        } if *status == TaskStatus::HumanReview || status.is_terminal() => Some(Settled {
            status: *status,
            review_reason: *review_reason,
        }),
        _ => None,
    }
}

fn print_event(event: &BoardEvent) {
    if let Some(json) = to_json(event) {
        println!("{}", json);
    }
}

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, args: RunArgs) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let _guard = init_logging(cli, &config)?;

    let work_dir = match &args.work_dir {
        Some(dir) => dir
            .canonicalize()
            .with_context(|| format!("Work directory {} does not exist", dir.display()))?,
        None => config.project_dir.clone(),
    };
    let title = args.title.clone().unwrap_or_else(|| args.spec_id.clone());
    let new = NewTask {
        id: None,
        spec_id: Some(args.spec_id.clone()),
        description: args.description.clone().unwrap_or_else(|| title.clone()),
        title,
        work_dir,
        plan_path: None,
        metadata: TaskMetadata {
            skip_ai_review: args.skip_ai_review,
            require_plan_review: args.require_plan_review,
            base_branch: None,
        },
    };

    let (board, engine) = Board::new(config).start();
    let mut events = board.subscribe();

    let task = board.create_task(new).await?;
    tracing::info!(task_id = %task.id, spec_id = %task.spec_id, "starting headless run");
    let started = board
        .act(&task.id, UserAction::Start)
        .await?
        .is_some_and(|t| t.status == TaskStatus::InProgress);

    let outcome = if started {
        stream_until_settled(&mut events, &task.id).await
    } else {
        None
    };
    // Whatever is still buffered (spawn errors in particular) goes out too.
    while let Ok(event) = events.try_recv() {
        if event.task_id() == task.id {
            print_event(&event);
        }
    }

    board.shutdown().await?;
    engine.await.context("Board engine panicked")?;

    match outcome {
        None if !started => anyhow::bail!("Worker for task {} did not start", task.spec_id),
        None => anyhow::bail!("Run for task {} interrupted", task.spec_id),
        Some(settled) if settled.is_failure() => anyhow::bail!(
            "Task {} finished as {}{}",
            task.spec_id,
            settled.status,
            settled
                .review_reason
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        ),
        Some(settled) => {
            tracing::info!(status = %settled.status, "run finished");
            Ok(())
        }
    }
}

async fn stream_until_settled(
    events: &mut broadcast::Receiver<BoardEvent>,
    task_id: &str,
) -> Option<Settled> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, stopping worker");
                return None;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if event.task_id() != task_id {
                        continue;
                    }
                    print_event(&event);
                    if let Some(settled) = settled(&event) {
                        return Some(settled);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
