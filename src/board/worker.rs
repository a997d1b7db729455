//! One external worker process tied to one task.
//!
//! The process is supervised by its own tokio task. Stdout is read line by
//! line and classified with [`parse_line`]: progress lines go out on the
//! progress channel, everything else on the lifecycle channel as logs. The
//! final [`WorkerSignal::Exited`] is always the last message a worker sends.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::events::LogStream;
use super::models::{Invocation, WorkerKind};
use super::progress::{LineKind, ProgressEvent, SequenceCounter, parse_line};
use crate::config::BoardConfig;
use crate::errors::OrchestratorError;

/// Generation tag. Every spawn gets a fresh one, so messages from a replaced
/// or killed worker can be told apart from the live one's.
pub type WorkerId = u64;

/// How long to keep reading output after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// A progress event tagged with the worker that produced it.
#[derive(Debug, Clone)]
pub struct WorkerProgress {
    pub task_id: String,
    pub worker_id: WorkerId,
    pub event: ProgressEvent,
}

#[derive(Debug, Clone)]
pub enum WorkerSignal {
    Log {
        task_id: String,
        worker_id: WorkerId,
        stream: LogStream,
        line: String,
    },
    Exited {
        task_id: String,
        worker_id: WorkerId,
        kind: WorkerKind,
        /// `None` when the process was terminated by a signal.
        code: Option<i32>,
        /// The worker printed the restart marker before exiting.
        restart_requested: bool,
    },
    /// The settling delay after a restart's kill has elapsed.
    RestartDue { task_id: String },
}

/// Senders every worker writes into. Cloned per spawn.
#[derive(Debug, Clone)]
pub struct WorkerChannels {
    pub progress: mpsc::Sender<WorkerProgress>,
    pub lifecycle: mpsc::Sender<WorkerSignal>,
}

/// Fully resolved command line for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Resolve program, script and arguments for `invocation`.
    ///
    /// Fails when the worker program or scripts directory is unconfigured, or
    /// when the script it needs does not exist.
    pub fn build(
        config: &BoardConfig,
        invocation: &Invocation,
        extra_env: &[(String, String)],
    ) -> Result<Self, OrchestratorError> {
        let program = config.worker_program();
        if program.trim().is_empty() {
            return Err(OrchestratorError::NotConfigured { what: "program" });
        }
        let scripts_dir = config.scripts_dir().ok_or(OrchestratorError::NotConfigured {
            what: "scripts directory",
        })?;
        if !scripts_dir.is_dir() {
            return Err(OrchestratorError::ToolMissing {
                what: "scripts directory",
                path: scripts_dir,
            });
        }

        let worker = &config.toml.worker;
        let script_name = match invocation.kind() {
            WorkerKind::DefinitionCreation => &worker.definition_script,
            WorkerKind::Execution | WorkerKind::Verification => &worker.run_script,
        };
        let script = scripts_dir.join(script_name);
        if !script.is_file() {
            return Err(OrchestratorError::ToolMissing {
                what: "script",
                path: script,
            });
        }

        let mut args = vec![script.display().to_string()];
        match invocation {
            Invocation::DefinitionCreation {
                work_item_description,
                work_dir,
                plan_dir_override,
                auto_approve,
            } => {
                if work_item_description.trim().is_empty() {
                    return Err(OrchestratorError::InvalidInvocation("work_item_description"));
                }
                args.extend([
                    "--task".to_string(),
                    work_item_description.clone(),
                    "--project-dir".to_string(),
                    work_dir.display().to_string(),
                ]);
                if let Some(dir) = plan_dir_override {
                    args.extend(["--spec-dir".to_string(), dir.display().to_string()]);
                }
                if *auto_approve {
                    args.push("--auto-approve".to_string());
                }
            }
            Invocation::Execution {
                spec_id,
                work_dir,
                auto_continue,
                force,
                base_branch,
            } => {
                if spec_id.trim().is_empty() {
                    return Err(OrchestratorError::InvalidInvocation("spec_id"));
                }
                args.extend([
                    "--spec".to_string(),
                    spec_id.clone(),
                    "--project-dir".to_string(),
                    work_dir.display().to_string(),
                ]);
                if *auto_continue {
                    args.push("--auto-continue".to_string());
                }
                if *force {
                    args.push("--force".to_string());
                }
                if let Some(branch) = base_branch {
                    args.extend(["--base-branch".to_string(), branch.clone()]);
                }
            }
            Invocation::Verification { spec_id, work_dir } => {
                if spec_id.trim().is_empty() {
                    return Err(OrchestratorError::InvalidInvocation("spec_id"));
                }
                args.extend([
                    "--spec".to_string(),
                    spec_id.clone(),
                    "--project-dir".to_string(),
                    work_dir.display().to_string(),
                    "--qa".to_string(),
                ]);
            }
        }

        let mut env: Vec<(String, String)> = worker
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(extra_env.iter().cloned());

        Ok(Self {
            program,
            args,
            work_dir: invocation.work_dir().to_path_buf(),
            env,
        })
    }

    fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Handle to a live worker. Dropping it does not stop the process; call
/// [`WorkerHandle::kill`].
#[derive(Debug)]
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    pub task_id: String,
    pub kind: WorkerKind,
    kill_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(
        task_id: &str,
        worker_id: WorkerId,
        kind: WorkerKind,
        command: &WorkerCommand,
        sequence: SequenceCounter,
        channels: WorkerChannels,
    ) -> Result<Self, OrchestratorError> {
        let mut child = command
            .to_command()
            .spawn()
            .map_err(OrchestratorError::SpawnFailed)?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout from worker process"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr from worker process"))?;

        tracing::info!(
            task_id = %task_id,
            worker_id,
            kind = %kind,
            pid = ?pid,
            program = %command.program,
            "spawned worker"
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = Supervisor {
            task_id: task_id.to_string(),
            worker_id,
            kind,
            sequence,
            channels,
        };
        let join = tokio::spawn(supervisor.run(child, stdout, stderr, kill_rx));

        Ok(Self {
            worker_id,
            task_id: task_id.to_string(),
            kind,
            kill_tx: Some(kill_tx),
            join,
        })
    }

    /// Ask the supervisor to terminate the process. Returns false when the
    /// process had already exited or a kill was already requested.
    pub fn kill(&mut self) -> bool {
        match self.kill_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the supervisor to finish (the process has exited and its
    /// output is drained).
    pub async fn wait(self) {
        if let Err(e) = self.join.await {
            tracing::warn!(task_id = %self.task_id, worker_id = self.worker_id, error = %e, "worker supervisor panicked");
        }
    }
}

struct Supervisor {
    task_id: String,
    worker_id: WorkerId,
    kind: WorkerKind,
    sequence: SequenceCounter,
    channels: WorkerChannels,
}

impl Supervisor {
    async fn run(
        self,
        mut child: tokio::process::Child,
        stdout: tokio::process::ChildStdout,
        stderr: tokio::process::ChildStderr,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let stderr_task = tokio::spawn(forward_logs(
            stderr,
            self.task_id.clone(),
            self.worker_id,
            self.channels.lifecycle.clone(),
        ));

        let mut lines = BufReader::new(stdout).lines();
        let mut stdout_open = true;
        let mut kill_requested = false;
        let mut killed = false;
        let mut restart_requested = false;

        let status = loop {
            tokio::select! {
                biased;
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        restart_requested |= self.handle_line(line).await;
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        tracing::debug!(task_id = %self.task_id, error = %e, "worker stdout closed");
                        stdout_open = false;
                    }
                },
                res = &mut kill_rx, if !kill_requested => {
                    kill_requested = true;
                    // A dropped sender means the handle went away, not a kill.
                    killed = res.is_ok();
                }
                status = child.wait() => break status,
            }
            if killed {
                killed = false;
                if let Err(e) = child.start_kill() {
                    tracing::warn!(task_id = %self.task_id, worker_id = self.worker_id, error = %e, "failed to kill worker");
                }
            }
        };

        // Pick up whatever the process wrote just before exiting.
        while stdout_open {
            match tokio::time::timeout(DRAIN_TIMEOUT, lines.next_line()).await {
                Ok(Ok(Some(line))) => restart_requested |= self.handle_line(line).await,
                _ => stdout_open = false,
            }
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, stderr_task).await.is_err() {
            tracing::debug!(task_id = %self.task_id, "stderr still open after exit, abandoning it");
        }

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, error = %e, "failed to wait for worker");
                None
            }
        };
        tracing::info!(
            task_id = %self.task_id,
            worker_id = self.worker_id,
            kind = %self.kind,
            code = ?code,
            "worker exited"
        );

        let _ = self
            .channels
            .lifecycle
            .send(WorkerSignal::Exited {
                task_id: self.task_id,
                worker_id: self.worker_id,
                kind: self.kind,
                code,
                restart_requested,
            })
            .await;
    }

    /// Route one stdout line. Returns true when it was a restart request.
    async fn handle_line(&self, line: String) -> bool {
        match parse_line(&line) {
            LineKind::Progress(event) => {
                let event = self.sequence.stamp(event);
                let _ = self
                    .channels
                    .progress
                    .send(WorkerProgress {
                        task_id: self.task_id.clone(),
                        worker_id: self.worker_id,
                        event,
                    })
                    .await;
                false
            }
            LineKind::RestartRequested => {
                tracing::info!(task_id = %self.task_id, worker_id = self.worker_id, "worker requested restart");
                true
            }
            LineKind::Log => {
                let _ = self
                    .channels
                    .lifecycle
                    .send(WorkerSignal::Log {
                        task_id: self.task_id.clone(),
                        worker_id: self.worker_id,
                        stream: LogStream::Stdout,
                        line,
                    })
                    .await;
                false
            }
        }
    }
}

async fn forward_logs<R: AsyncRead + Unpin>(
    reader: R,
    task_id: String,
    worker_id: WorkerId,
    tx: mpsc::Sender<WorkerSignal>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let signal = WorkerSignal::Log {
            task_id: task_id.clone(),
            worker_id,
            stream: LogStream::Stderr,
            line,
        };
        if tx.send(signal).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardToml;
    use crate::board::models::ExecutionPhase;
    use tempfile::TempDir;

    fn config_with_script(script_name: &str, body: &str) -> (TempDir, BoardConfig) {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        std::fs::write(scripts.join(script_name), body).unwrap();

        let mut toml = BoardToml::default();
        toml.worker.program = "sh".to_string();
        toml.worker.scripts_dir = Some(scripts.clone());
        toml.worker.run_script = script_name.to_string();
        toml.worker.definition_script = script_name.to_string();
        let mut config = BoardConfig::from_toml(dir.path().to_path_buf(), toml);
        config.cli_worker_program = Some("sh".to_string());
        config.cli_scripts_dir = Some(scripts);
        (dir, config)
    }

    fn execution(dir: &TempDir) -> Invocation {
        Invocation::Execution {
            spec_id: "001-auth".to_string(),
            work_dir: dir.path().to_path_buf(),
            auto_continue: true,
            force: false,
            base_branch: Some("main".to_string()),
        }
    }

    fn channels() -> (
        WorkerChannels,
        mpsc::Receiver<WorkerProgress>,
        mpsc::Receiver<WorkerSignal>,
    ) {
        let (progress, progress_rx) = mpsc::channel(64);
        let (lifecycle, lifecycle_rx) = mpsc::channel(64);
        (WorkerChannels { progress, lifecycle }, progress_rx, lifecycle_rx)
    }

    async fn wait_for_exit(rx: &mut mpsc::Receiver<WorkerSignal>) -> (Vec<String>, Option<i32>, bool) {
        let mut logs = Vec::new();
        loop {
            let signal = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("worker did not exit in time")
                .expect("lifecycle channel closed");
            match signal {
                WorkerSignal::Log { line, .. } => logs.push(line),
                WorkerSignal::Exited {
                    code,
                    restart_requested,
                    ..
                } => return (logs, code, restart_requested),
                WorkerSignal::RestartDue { .. } => {}
            }
        }
    }

    #[test]
    fn test_build_execution_args() {
        let (dir, config) = config_with_script("run.py", "");
        let cmd = WorkerCommand::build(&config, &execution(&dir), &[]).unwrap();
        assert_eq!(cmd.program, "sh");
        assert!(cmd.args[0].ends_with("run.py"));
        assert_eq!(&cmd.args[1..3], ["--spec", "001-auth"]);
        assert!(cmd.args.contains(&"--auto-continue".to_string()));
        assert!(!cmd.args.contains(&"--force".to_string()));
        assert_eq!(&cmd.args[cmd.args.len() - 2..], ["--base-branch", "main"]);
        assert_eq!(cmd.work_dir, dir.path());
    }

    #[test]
    fn test_build_verification_args() {
        let (dir, config) = config_with_script("run.py", "");
        let invocation = Invocation::Verification {
            spec_id: "001-auth".to_string(),
            work_dir: dir.path().to_path_buf(),
        };
        let cmd = WorkerCommand::build(&config, &invocation, &[]).unwrap();
        assert_eq!(cmd.args.last().map(String::as_str), Some("--qa"));
    }

    #[test]
    fn test_build_definition_args_and_env() {
        let (dir, mut config) = config_with_script("spec_runner.py", "");
        config
            .toml
            .worker
            .env
            .insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        let invocation = Invocation::DefinitionCreation {
            work_item_description: "Add login".to_string(),
            work_dir: dir.path().to_path_buf(),
            plan_dir_override: Some(PathBuf::from("/tmp/specs")),
            auto_approve: true,
        };
        let extra = [("EXTRA".to_string(), "yes".to_string())];
        let cmd = WorkerCommand::build(&config, &invocation, &extra).unwrap();
        assert_eq!(&cmd.args[1..3], ["--task", "Add login"]);
        assert!(cmd.args.contains(&"--spec-dir".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("--auto-approve"));
        assert!(cmd.env.contains(&("PYTHONUNBUFFERED".to_string(), "1".to_string())));
        assert!(cmd.env.contains(&("EXTRA".to_string(), "yes".to_string())));
    }

    #[test]
    fn test_build_requires_scripts_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BoardConfig::from_toml(dir.path().to_path_buf(), BoardToml::default());
        config.cli_worker_program = Some("sh".to_string());
        // Only meaningful when the environment does not supply one.
        if std::env::var("AGENTBOARD_SCRIPTS_DIR").is_ok() {
            return;
        }
        let err = WorkerCommand::build(&config, &execution(&dir), &[]).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotConfigured { .. }));
    }

    #[test]
    fn test_build_reports_missing_script() {
        let (dir, mut config) = config_with_script("run.py", "");
        config.toml.worker.run_script = "missing.py".to_string();
        let err = WorkerCommand::build(&config, &execution(&dir), &[]).unwrap_err();
        match err {
            OrchestratorError::ToolMissing { what, path } => {
                assert_eq!(what, "script");
                assert!(path.ends_with("missing.py"));
            }
            other => panic!("Expected ToolMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_build_rejects_empty_spec_id() {
        let (dir, config) = config_with_script("run.py", "");
        let invocation = Invocation::Verification {
            spec_id: " ".to_string(),
            work_dir: dir.path().to_path_buf(),
        };
        assert!(matches!(
            WorkerCommand::build(&config, &invocation, &[]),
            Err(OrchestratorError::InvalidInvocation("spec_id"))
        ));
    }

    #[tokio::test]
    async fn test_worker_streams_progress_logs_and_exit_code() {
        let script = r#"
echo "starting"
echo '__EXEC_PHASE__:{"phase":"planning","overall_progress":5}'
echo "oops" 1>&2
echo '__EXEC_PHASE__:{"phase":"coding","overall_progress":40}'
exit 3
"#;
        let (dir, config) = config_with_script("run.py", script);
        let cmd = WorkerCommand::build(&config, &execution(&dir), &[]).unwrap();
        let (channels, mut progress_rx, mut lifecycle_rx) = channels();
        let sequence = SequenceCounter::new();

        let handle = WorkerHandle::spawn(
            "t1",
            7,
            WorkerKind::Execution,
            &cmd,
            sequence.clone(),
            channels,
        )
        .unwrap();
        assert_eq!(handle.worker_id, 7);

        let (logs, code, restart_requested) = wait_for_exit(&mut lifecycle_rx).await;
        assert_eq!(code, Some(3));
        assert!(!restart_requested);
        assert!(logs.contains(&"starting".to_string()));
        assert!(logs.contains(&"oops".to_string()));

        let first = progress_rx.recv().await.unwrap();
        let second = progress_rx.recv().await.unwrap();
        assert_eq!(first.worker_id, 7);
        assert_eq!(first.event.phase, ExecutionPhase::Planning);
        assert_eq!(second.event.phase, ExecutionPhase::Coding);
        assert!(second.event.sequence_number > first.event.sequence_number);
        assert_eq!(sequence.current(), second.event.sequence_number);
    }

    #[tokio::test]
    async fn test_worker_reports_restart_request() {
        let (dir, config) = config_with_script("run.py", "echo __RESTART_REQUESTED__\nexit 1\n");
        let cmd = WorkerCommand::build(&config, &execution(&dir), &[]).unwrap();
        let (channels, _progress_rx, mut lifecycle_rx) = channels();
        let _handle = WorkerHandle::spawn(
            "t1",
            1,
            WorkerKind::Execution,
            &cmd,
            SequenceCounter::new(),
            channels,
        )
        .unwrap();
        let (_, code, restart_requested) = wait_for_exit(&mut lifecycle_rx).await;
        assert_eq!(code, Some(1));
        assert!(restart_requested);
    }

    #[tokio::test]
    async fn test_kill_terminates_worker() {
        let (dir, config) = config_with_script("run.py", "echo ready\nexec sleep 30\n");
        let cmd = WorkerCommand::build(&config, &execution(&dir), &[]).unwrap();
        let (channels, _progress_rx, mut lifecycle_rx) = channels();
        let mut handle = WorkerHandle::spawn(
            "t1",
            1,
            WorkerKind::Execution,
            &cmd,
            SequenceCounter::new(),
            channels,
        )
        .unwrap();

        assert!(handle.kill());
        assert!(!handle.kill(), "second kill should report nothing to kill");
        let (_, code, _) = wait_for_exit(&mut lifecycle_rx).await;
        assert_eq!(code, None, "killed process has no exit code");
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let (dir, mut config) = config_with_script("run.py", "");
        config.cli_worker_program = Some("/nonexistent/interpreter".to_string());
        let cmd = WorkerCommand::build(&config, &execution(&dir), &[]).unwrap();
        let (channels, _p, _l) = channels();
        let err = WorkerHandle::spawn(
            "t1",
            1,
            WorkerKind::Execution,
            &cmd,
            SequenceCounter::new(),
            channels,
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::SpawnFailed(_)));
    }
}
