//! The board engine: one actor loop that owns the task store, the process
//! orchestrator and the plan watchers.
//!
//! Every input arrives on a bounded channel and is applied in turn, so the
//! reconciler never needs a lock. The loop polls in a fixed order (user
//! commands, then progress, then worker lifecycle, then plan snapshots), so
//! a worker's progress is always applied before its own exit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::events::{BoardEvent, emit};
use super::models::{NewTask, Task, WorkerKind};
use super::orchestrator::ProcessOrchestrator;
use super::plan::SignoffStatus;
use super::reconciler::{Effect, Liveness, StatusReconciler, UserAction};
use super::store::{TaskList, TaskStore};
use super::watcher::{PlanUpdate, PlanWatcher, WatcherHandle};
use super::worker::{WorkerChannels, WorkerId, WorkerProgress, WorkerSignal};
use crate::config::BoardConfig;
use crate::errors::BoardError;

const COMMAND_CAPACITY: usize = 64;
const PROGRESS_CAPACITY: usize = 256;
const LIFECYCLE_CAPACITY: usize = 256;
const PLAN_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, BoardError>>;

enum Command {
    Create {
        new: NewTask,
        reply: Reply<Arc<Task>>,
    },
    Act {
        key: String,
        action: UserAction,
        reply: Reply<Option<Arc<Task>>>,
    },
    Restart {
        key: String,
        reply: Reply<bool>,
    },
    Liveness {
        key: String,
        reply: Reply<Liveness>,
    },
    Tasks {
        reply: Reply<TaskList>,
    },
    Task {
        key: String,
        reply: Reply<Option<Arc<Task>>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable front door to a running board.
#[derive(Clone)]
pub struct BoardHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<BoardEvent>,
}

impl BoardHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, BoardError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| BoardError::EngineClosed)?;
        rx.await.map_err(|_| BoardError::EngineClosed)?
    }

    pub async fn create_task(&self, new: NewTask) -> Result<Arc<Task>, BoardError> {
        self.request(|reply| Command::Create { new, reply }).await
    }

    /// Apply a user action. Returns the updated task, or `None` once it has
    /// been deleted.
    pub async fn act(
        &self,
        key: &str,
        action: UserAction,
    ) -> Result<Option<Arc<Task>>, BoardError> {
        let key = key.to_string();
        self.request(|reply| Command::Act { key, action, reply })
            .await
    }

    pub async fn restart(&self, key: &str) -> Result<bool, BoardError> {
        let key = key.to_string();
        self.request(|reply| Command::Restart { key, reply }).await
    }

    pub async fn liveness(&self, key: &str) -> Result<Liveness, BoardError> {
        let key = key.to_string();
        self.request(|reply| Command::Liveness { key, reply }).await
    }

    pub async fn tasks(&self) -> Result<TaskList, BoardError> {
        self.request(|reply| Command::Tasks { reply }).await
    }

    pub async fn task(&self, key: &str) -> Result<Option<Arc<Task>>, BoardError> {
        let key = key.to_string();
        self.request(|reply| Command::Task { key, reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    /// Kill every worker, stop all watchers and end the loop.
    pub async fn shutdown(&self) -> Result<(), BoardError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct Board {
    config: Arc<BoardConfig>,
    store: TaskStore,
    orchestrator: ProcessOrchestrator,
    watchers: HashMap<String, WatcherHandle>,
    /// Last QA sign-off seen in each task's plan.
    signoffs: HashMap<String, SignoffStatus>,
    events: broadcast::Sender<BoardEvent>,
    progress_rx: mpsc::Receiver<WorkerProgress>,
    lifecycle_rx: mpsc::Receiver<WorkerSignal>,
    plan_tx: mpsc::Sender<PlanUpdate>,
    plan_rx: mpsc::Receiver<PlanUpdate>,
}

impl Board {
    pub fn new(config: BoardConfig) -> Self {
        let config = Arc::new(config);
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CAPACITY);
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(LIFECYCLE_CAPACITY);
        let (plan_tx, plan_rx) = mpsc::channel(PLAN_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let channels = WorkerChannels {
            progress: progress_tx,
            lifecycle: lifecycle_tx,
        };
        let orchestrator = ProcessOrchestrator::new(Arc::clone(&config), channels, events.clone());

        Self {
            config,
            store: TaskStore::new(),
            orchestrator,
            watchers: HashMap::new(),
            signoffs: HashMap::new(),
            events,
            progress_rx,
            lifecycle_rx,
            plan_tx,
            plan_rx,
        }
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Spawn the loop. It ends on `shutdown()` or when every handle is gone.
    pub fn start(self) -> (BoardHandle, JoinHandle<()>) {
        let (commands, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = BoardHandle {
            commands,
            events: self.events.clone(),
        };
        let join = tokio::spawn(self.run(commands_rx));
        (handle, join)
    }

    async fn run(mut self, mut commands_rx: mpsc::Receiver<Command>) {
        tracing::info!("board engine started");
        loop {
            tokio::select! {
                biased;
                command = commands_rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(progress) = self.progress_rx.recv() => self.on_progress(progress),
                Some(signal) = self.lifecycle_rx.recv() => self.on_signal(signal),
                Some(update) = self.plan_rx.recv() => self.on_plan(update),
            }
        }
        tracing::info!("board engine stopped");
    }

    async fn shutdown(&mut self) {
        tracing::info!(workers = self.orchestrator.running_count(), "shutting down board");
        // Closed receivers make late worker sends fail fast instead of
        // blocking the supervisors we are about to wait on.
        self.progress_rx.close();
        self.lifecycle_rx.close();
        self.plan_rx.close();
        for (_, watcher) in self.watchers.drain() {
            watcher.stop();
        }
        self.orchestrator.kill_all().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Create { new, reply } => {
                let _ = reply.send(self.create(new));
            }
            Command::Act { key, action, reply } => {
                let _ = reply.send(self.act(&key, action));
            }
            Command::Restart { key, reply } => {
                let result = self.require(&key).map(|task| {
                    let restarted = self.orchestrator.restart(&task.id);
                    if restarted {
                        self.commit(&task.id, StatusReconciler::apply_restart);
                    }
                    restarted
                });
                let _ = reply.send(result);
            }
            Command::Liveness { key, reply } => {
                let result = self.require(&key).map(|task| {
                    StatusReconciler::liveness(
                        &task,
                        self.orchestrator.is_running(&task.id),
                        self.config.grace_period(),
                        Utc::now(),
                    )
                });
                let _ = reply.send(result);
            }
            Command::Tasks { reply } => {
                let _ = reply.send(Ok(self.store.snapshot()));
            }
            Command::Task { key, reply } => {
                let _ = reply.send(Ok(self.store.get(&key)));
            }
            Command::Shutdown { reply } => {
                // Handled in the loop; kept exhaustive for the compiler.
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn require(&self, key: &str) -> Result<Arc<Task>, BoardError> {
        self.store.get(key).ok_or_else(|| BoardError::TaskNotFound {
            key: key.to_string(),
        })
    }

    fn create(&mut self, new: NewTask) -> Result<Arc<Task>, BoardError> {
        if let Some(id) = &new.id
            && self.store.find_by_id_or_spec_id(id).is_some()
        {
            return Err(BoardError::DuplicateTask { id: id.clone() });
        }
        let task = self.store.insert(Task::new(new));
        tracing::info!(task_id = %task.id, spec_id = %task.spec_id, "task created");

        let plan_path = self.config.toml.plan.plan_path_for(&task);
        let watcher = PlanWatcher::new(
            task.id.clone(),
            plan_path,
            self.config.poll_interval(),
            self.plan_tx.clone(),
        )
        .spawn();
        self.watchers.insert(task.id.clone(), watcher);

        emit(
            &self.events,
            BoardEvent::TaskCreated {
                task: (*task).clone(),
            },
        );
        Ok(task)
    }

    fn act(&mut self, key: &str, action: UserAction) -> Result<Option<Arc<Task>>, BoardError> {
        let task = self.require(key)?;
        let has_plan = self.config.toml.plan.plan_path_for(&task).is_file();
        let (next, effects) = StatusReconciler::apply_user_action(&task, &action, has_plan)?;
        let id = task.id.clone();

        let mut spawned = true;
        let mut forgotten = false;
        for effect in effects {
            match effect {
                Effect::Kill => {
                    self.orchestrator.kill(&id);
                }
                Effect::ResetContext => self.orchestrator.reset_context(&id),
                Effect::Spawn { invocation, env } => {
                    spawned &= self
                        .orchestrator
                        .spawn_with_env(&id, &task.spec_id, invocation, env);
                }
                Effect::Forget => {
                    self.forget(&id);
                    forgotten = true;
                }
            }
        }

        if forgotten {
            return Ok(None);
        }
        if !spawned {
            tracing::warn!(task_id = %id, action = action.name(), "worker did not start, task keeps its status");
            return Ok(Some(task));
        }
        self.commit(&id, |_| next);
        Ok(self.store.get(&id))
    }

    fn forget(&mut self, id: &str) {
        if let Some(watcher) = self.watchers.remove(id) {
            watcher.stop();
        }
        self.signoffs.remove(id);
        if self.store.remove(id).is_some() {
            tracing::info!(task_id = %id, "task deleted");
            emit(
                &self.events,
                BoardEvent::TaskDeleted {
                    task_id: id.to_string(),
                },
            );
        }
    }

    /// Run `updater` through the store and announce whatever changed.
    fn commit<F>(&mut self, key: &str, updater: F) -> Option<Arc<Task>>
    where
        F: FnOnce(&Arc<Task>) -> Arc<Task>,
    {
        let before = self.store.get(key)?;
        let after = self.store.update(key, updater)?;
        self.announce(&before, &after);
        Some(after)
    }

    fn announce(&self, before: &Task, after: &Task) {
        if before.status != after.status || before.review_reason != after.review_reason {
            emit(
                &self.events,
                BoardEvent::StatusChanged {
                    task_id: after.id.clone(),
                    status: after.status,
                    review_reason: after.review_reason,
                },
            );
        }
        if before.execution_progress != after.execution_progress {
            emit(
                &self.events,
                BoardEvent::ProgressUpdated {
                    task_id: after.id.clone(),
                    progress: after.execution_progress,
                },
            );
        }
        if before.subtasks != after.subtasks {
            emit(
                &self.events,
                BoardEvent::SubtasksUpdated {
                    task_id: after.id.clone(),
                    subtasks: after.subtasks.clone(),
                },
            );
        }
    }

    fn on_progress(&mut self, progress: WorkerProgress) {
        let WorkerProgress {
            task_id,
            worker_id,
            event,
        } = progress;
        if self.orchestrator.live_worker_id(&task_id) != Some(worker_id) {
            tracing::debug!(task_id = %task_id, worker_id, "dropping progress from superseded worker");
            return;
        }
        self.commit(&task_id, |task| StatusReconciler::apply_progress(task, &event));
    }

    fn on_signal(&mut self, signal: WorkerSignal) {
        match signal {
            WorkerSignal::Log {
                task_id,
                worker_id,
                stream,
                line,
            } => {
                tracing::debug!(task_id = %task_id, worker_id, ?stream, "{}", line);
                emit(&self.events, BoardEvent::Log { task_id, stream, line });
            }
            WorkerSignal::RestartDue { task_id } => {
                if self.store.get(&task_id).is_some() {
                    self.orchestrator.complete_restart(&task_id);
                }
            }
            WorkerSignal::Exited {
                task_id,
                worker_id,
                kind,
                code,
                restart_requested,
            } => self.on_exit(&task_id, worker_id, kind, code, restart_requested),
        }
    }

    fn on_exit(
        &mut self,
        task_id: &str,
        worker_id: WorkerId,
        kind: WorkerKind,
        code: Option<i32>,
        restart_requested: bool,
    ) {
        emit(
            &self.events,
            BoardEvent::WorkerExited {
                task_id: task_id.to_string(),
                kind,
                code,
            },
        );
        // Only the live worker's exit moves the task.
        let Some(exit) = self
            .orchestrator
            .observe_exit(task_id, worker_id, kind, code, restart_requested)
        else {
            return;
        };
        if self.store.get(task_id).is_none() {
            self.orchestrator.release_context(task_id, &exit);
            return;
        }

        let wants_restart = !exit.success()
            && (exit.restart_requested || self.config.toml.restart.restart_on_failure);
        if wants_restart && self.orchestrator.restart(task_id) {
            // The status is left alone while the replacement spins up.
            self.orchestrator.release_context(task_id, &exit);
            return;
        }

        let signoff = self.signoffs.get(task_id).copied();
        let mut follow_up = None;
        self.commit(task_id, |task| {
            let (next, chained) = StatusReconciler::apply_exit(task, &exit, signoff);
            follow_up = chained;
            next
        });

        match follow_up {
            // Chaining keeps the context so sequence numbers keep climbing.
            Some(invocation) => {
                let spec_id = self
                    .store
                    .get(task_id)
                    .map(|t| t.spec_id.clone())
                    .unwrap_or_default();
                tracing::info!(task_id = %task_id, next = %invocation.kind(), "chaining worker");
                self.orchestrator.spawn(task_id, &spec_id, invocation);
            }
            None => self.orchestrator.release_context(task_id, &exit),
        }
    }

    fn on_plan(&mut self, update: PlanUpdate) {
        let PlanUpdate { task_id, snapshot } = update;
        if self.store.get(&task_id).is_none() {
            return;
        }
        match snapshot.signoff {
            Some(signoff) => {
                self.signoffs.insert(task_id.clone(), signoff);
            }
            None => {
                self.signoffs.remove(&task_id);
            }
        }
        self.commit(&task_id, |task| StatusReconciler::apply_plan(task, &snapshot));
    }
}
