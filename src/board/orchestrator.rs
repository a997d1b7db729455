//! Process orchestrator: spawns, kills and restarts workers, one per task.
//!
//! The orchestrator is owned by the board loop and never shared, so it holds
//! plain maps. Exit handling is split in two so a restart can claim a
//! context before cleanup looks at it:
//!
//! ```text
//!   Exited ──▶ observe_exit ──▶ reconciler (may call restart → claim)
//!                                   │
//!                                   ▼
//!                            release_context ── claimed? keep : cleanup rule
//! ```
//!
//! A restart never sleeps on the loop. It kills the worker, arms a timer task
//! that posts [`WorkerSignal::RestartDue`] after the settling delay, and the
//! loop calls [`ProcessOrchestrator::complete_restart`] when that arrives.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::events::{BoardEvent, emit};
use super::models::{Invocation, WorkerKind};
use super::progress::SequenceCounter;
use super::worker::{WorkerChannels, WorkerCommand, WorkerHandle, WorkerId, WorkerSignal};
use crate::config::BoardConfig;

/// What the orchestrator remembers about a task between spawns.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub work_dir: PathBuf,
    pub spec_id: String,
    pub invocation: Invocation,
    pub is_initial_creation: bool,
    pub swap_count: u32,
    /// Shared by every worker of the task so numbering survives restarts.
    pub sequence: SequenceCounter,
    pub env: Vec<(String, String)>,
    claim: Option<CancellationToken>,
}

impl ExecutionContext {
    fn new(invocation: Invocation, spec_id: String, env: Vec<(String, String)>) -> Self {
        Self {
            work_dir: invocation.work_dir().to_path_buf(),
            spec_id,
            is_initial_creation: invocation.kind() == WorkerKind::DefinitionCreation,
            invocation,
            swap_count: 0,
            sequence: SequenceCounter::new(),
            env,
            claim: None,
        }
    }

    /// A restart is pending for this context.
    pub fn is_claimed(&self) -> bool {
        self.claim.as_ref().is_some_and(|t| !t.is_cancelled())
    }
}

/// An exit from the task's live worker, as seen by the first phase of exit
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedExit {
    pub kind: WorkerKind,
    pub code: Option<i32>,
    pub restart_requested: bool,
}

impl ObservedExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub struct ProcessOrchestrator {
    config: Arc<BoardConfig>,
    channels: WorkerChannels,
    events: broadcast::Sender<BoardEvent>,
    workers: HashMap<String, WorkerHandle>,
    contexts: HashMap<String, ExecutionContext>,
    next_worker_id: WorkerId,
}

impl ProcessOrchestrator {
    pub fn new(
        config: Arc<BoardConfig>,
        channels: WorkerChannels,
        events: broadcast::Sender<BoardEvent>,
    ) -> Self {
        Self {
            config,
            channels,
            events,
            workers: HashMap::new(),
            contexts: HashMap::new(),
            next_worker_id: 1,
        }
    }

    pub fn max_swaps(&self) -> u32 {
        self.config.toml.restart.max_swaps
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.workers
            .get(task_id)
            .is_some_and(|w| !w.is_finished())
    }

    pub fn live_worker_id(&self, task_id: &str) -> Option<WorkerId> {
        self.workers.get(task_id).map(|w| w.worker_id)
    }

    pub fn context(&self, task_id: &str) -> Option<&ExecutionContext> {
        self.contexts.get(task_id)
    }

    pub fn running_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawn a worker for `task_id`, replacing any live one.
    ///
    /// Returns whether a worker is now running. Failures are reported as an
    /// `Error` event and never escape.
    pub fn spawn(&mut self, task_id: &str, spec_id: &str, invocation: Invocation) -> bool {
        self.spawn_with_env(task_id, spec_id, invocation, Vec::new())
    }

    pub fn spawn_with_env(
        &mut self,
        task_id: &str,
        spec_id: &str,
        invocation: Invocation,
        env: Vec<(String, String)>,
    ) -> bool {
        self.cancel_claim(task_id);
        self.kill_worker(task_id);

        // Keep swap_count and the sequence counter when the task already has
        // a context; only the invocation changes.
        let fresh = match self.contexts.get_mut(task_id) {
            Some(ctx) => {
                ctx.work_dir = invocation.work_dir().to_path_buf();
                ctx.is_initial_creation = invocation.kind() == WorkerKind::DefinitionCreation;
                ctx.invocation = invocation;
                ctx.spec_id = spec_id.to_string();
                ctx.env = env;
                false
            }
            None => {
                self.contexts.insert(
                    task_id.to_string(),
                    ExecutionContext::new(invocation, spec_id.to_string(), env),
                );
                true
            }
        };
        let launched = self.launch(task_id);
        // A task that never had a worker has nothing to restart.
        if !launched && fresh {
            self.contexts.remove(task_id);
        }
        launched
    }

    /// Forget a task's context, so the next spawn starts with a fresh swap
    /// budget.
    pub fn reset_context(&mut self, task_id: &str) {
        self.cancel_claim(task_id);
        self.contexts.remove(task_id);
    }

    fn launch(&mut self, task_id: &str) -> bool {
        let Some(ctx) = self.contexts.get(task_id) else {
            return false;
        };
        let kind = ctx.invocation.kind();
        let sequence = ctx.sequence.clone();

        let command = match WorkerCommand::build(&self.config, &ctx.invocation, &ctx.env) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(task_id = %task_id, kind = %kind, error = %e, "worker not spawned");
                self.report_error(task_id, e.to_string());
                return false;
            }
        };

        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        match WorkerHandle::spawn(
            task_id,
            worker_id,
            kind,
            &command,
            sequence,
            self.channels.clone(),
        ) {
            Ok(handle) => {
                self.workers.insert(task_id.to_string(), handle);
                true
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, kind = %kind, error = %e, "worker spawn failed");
                self.report_error(task_id, e.to_string());
                false
            }
        }
    }

    fn report_error(&self, task_id: &str, message: String) {
        emit(
            &self.events,
            BoardEvent::Error {
                task_id: task_id.to_string(),
                message,
            },
        );
    }

    /// Terminate the live worker and cancel any pending restart. Returns
    /// whether a process was actually terminated.
    pub fn kill(&mut self, task_id: &str) -> bool {
        self.cancel_claim(task_id);
        self.kill_worker(task_id)
    }

    fn kill_worker(&mut self, task_id: &str) -> bool {
        let Some(mut handle) = self.workers.remove(task_id) else {
            return false;
        };
        let killed = handle.kill();
        if killed {
            tracing::info!(task_id = %task_id, worker_id = handle.worker_id, "killed worker");
        }
        killed
    }

    fn cancel_claim(&mut self, task_id: &str) {
        if let Some(token) = self.contexts.get_mut(task_id).and_then(|c| c.claim.take()) {
            token.cancel();
        }
    }

    /// Bounded restart. Refuses when the task has no context or its swap
    /// budget is spent; otherwise claims the context, kills the live worker
    /// and schedules the respawn after the settling delay.
    pub fn restart(&mut self, task_id: &str) -> bool {
        let max_swaps = self.max_swaps();
        let Some(ctx) = self.contexts.get_mut(task_id) else {
            tracing::debug!(task_id = %task_id, "restart refused: no execution context");
            return false;
        };
        if ctx.swap_count >= max_swaps {
            tracing::info!(task_id = %task_id, swap_count = ctx.swap_count, "restart refused: swap limit reached");
            return false;
        }

        ctx.swap_count += 1;
        if let Some(previous) = ctx.claim.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        ctx.claim = Some(token.clone());
        let swap_count = ctx.swap_count;

        self.kill_worker(task_id);

        let delay = self.config.settle_delay();
        let tx = self.channels.lifecycle.clone();
        let id = task_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(WorkerSignal::RestartDue { task_id: id }).await;
                }
            }
        });

        tracing::info!(task_id = %task_id, swap_count, delay_ms = delay.as_millis() as u64, "restart scheduled");
        true
    }

    /// Second half of a restart: respawn from the stored context if the claim
    /// is still standing.
    pub fn complete_restart(&mut self, task_id: &str) -> bool {
        let Some(ctx) = self.contexts.get_mut(task_id) else {
            return false;
        };
        match ctx.claim.take() {
            Some(token) if !token.is_cancelled() => {}
            _ => {
                tracing::debug!(task_id = %task_id, "restart no longer claimed, skipping respawn");
                return false;
            }
        }
        self.launch(task_id)
    }

    /// First phase of exit handling. Returns the exit when it came from the
    /// task's live worker; exits of replaced or killed workers return `None`.
    pub fn observe_exit(
        &mut self,
        task_id: &str,
        worker_id: WorkerId,
        kind: WorkerKind,
        code: Option<i32>,
        restart_requested: bool,
    ) -> Option<ObservedExit> {
        if self.live_worker_id(task_id) != Some(worker_id) {
            tracing::debug!(task_id = %task_id, worker_id, "ignoring exit of superseded worker");
            return None;
        }
        self.workers.remove(task_id);
        Some(ObservedExit {
            kind,
            code,
            restart_requested,
        })
    }

    /// Second phase of exit handling. Claimed contexts are left alone;
    /// otherwise success deletes the context, and so does a failure once
    /// the swap budget is spent.
    pub fn release_context(&mut self, task_id: &str, exit: &ObservedExit) {
        let max_swaps = self.max_swaps();
        let Some(ctx) = self.contexts.get(task_id) else {
            return;
        };
        if ctx.is_claimed() {
            return;
        }
        if exit.success() || ctx.swap_count >= max_swaps {
            tracing::debug!(task_id = %task_id, swap_count = ctx.swap_count, "execution context released");
            self.contexts.remove(task_id);
        }
    }

    /// Terminate every live worker and wait for their supervisors to finish.
    pub async fn kill_all(&mut self) {
        for ctx in self.contexts.values_mut() {
            if let Some(token) = ctx.claim.take() {
                token.cancel();
            }
        }
        let handles: Vec<WorkerHandle> = self.workers.drain().map(|(_, h)| h).collect();
        for mut handle in handles {
            handle.kill();
            tracing::info!(task_id = %handle.task_id, worker_id = handle.worker_id, "stopping worker for shutdown");
            handle.wait().await;
        }
    }
}
