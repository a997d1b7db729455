//! Fixtures shared by the board's unit tests: a temp project with `/bin/sh`
//! worker scripts standing in for the real agent.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::sync::mpsc;

use super::worker::{WorkerChannels, WorkerProgress, WorkerSignal};
use crate::config::{BoardConfig, BoardToml};

pub const RUN_SCRIPT: &str = "run.sh";
pub const DEFINITION_SCRIPT: &str = "define.sh";

pub struct FakeWorker {
    dir: TempDir,
}

impl FakeWorker {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        Self { dir }
    }

    pub fn run_script(self, body: &str) -> Self {
        std::fs::write(self.scripts_dir().join(RUN_SCRIPT), body).unwrap();
        self
    }

    pub fn definition_script(self, body: &str) -> Self {
        std::fs::write(self.scripts_dir().join(DEFINITION_SCRIPT), body).unwrap();
        self
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.dir.path().join("scripts")
    }

    pub fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn project_dir(&self) -> PathBuf {
        self.dir.path().join("project")
    }

    /// Write a plan document at `path`, creating parent directories.
    pub fn write_plan(path: &Path, json: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, json).unwrap();
    }

    pub fn config(&self) -> BoardConfig {
        let mut toml = BoardToml::default();
        toml.worker.program = "sh".to_string();
        toml.worker.scripts_dir = Some(self.scripts_dir());
        toml.worker.run_script = RUN_SCRIPT.to_string();
        toml.worker.definition_script = DEFINITION_SCRIPT.to_string();
        toml.restart.settle_delay_ms = 20;
        toml.plan.poll_interval_ms = 20;
        toml.liveness.grace_period_secs = 0;

        let mut config = BoardConfig::from_toml(self.project_dir(), toml);
        // Pin both so AGENTBOARD_* variables in the environment can't interfere.
        config.cli_worker_program = Some("sh".to_string());
        config.cli_scripts_dir = Some(self.scripts_dir());
        config
    }
}

pub fn channels() -> (
    WorkerChannels,
    mpsc::Receiver<WorkerProgress>,
    mpsc::Receiver<WorkerSignal>,
) {
    let (progress, progress_rx) = mpsc::channel(64);
    let (lifecycle, lifecycle_rx) = mpsc::channel(64);
    (
        WorkerChannels {
            progress,
            lifecycle,
        },
        progress_rx,
        lifecycle_rx,
    )
}
