//! Configuration for agentboard.
//!
//! Settings are read from `.agentboard/board.toml` and layered
//! file → environment → CLI. Every field has a default, so an empty or
//! missing file is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [worker]
//! program = "python3"
//! scripts_dir = "/opt/agent/backend"
//! definition_script = "spec_runner.py"
//! run_script = "run.py"
//!
//! [worker.env]
//! PYTHONUNBUFFERED = "1"
//!
//! [restart]
//! max_swaps = 2
//! settle_delay_ms = 500
//! restart_on_failure = false
//!
//! [plan]
//! specs_dir = ".agentboard/specs"
//! file_name = "implementation_plan.json"
//! poll_interval_ms = 1000
//!
//! [liveness]
//! grace_period_secs = 30
//!
//! [server]
//! port = 3141
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::board::models::Task;

pub const BOARD_DIR: &str = ".agentboard";
pub const CONFIG_FILE: &str = "board.toml";

/// How the worker process is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Interpreter or binary that runs the worker scripts.
    #[serde(default = "default_program")]
    pub program: String,
    /// Directory holding the worker scripts. Required before any spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts_dir: Option<PathBuf>,
    #[serde(default = "default_definition_script")]
    pub definition_script: String,
    #[serde(default = "default_run_script")]
    pub run_script: String,
    /// Extra environment passed to every worker.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_program() -> String {
    "python3".to_string()
}

fn default_definition_script() -> String {
    "spec_runner.py".to_string()
}

fn default_run_script() -> String {
    "run.py".to_string()
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            scripts_dir: None,
            definition_script: default_definition_script(),
            run_script: default_run_script(),
            env: BTreeMap::new(),
        }
    }
}

/// Bounded restart ("swap") policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSection {
    #[serde(default = "default_max_swaps")]
    pub max_swaps: u32,
    /// Pause between killing a worker and spawning its replacement.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Restart on any non-zero exit, not only when the worker asks for it.
    #[serde(default)]
    pub restart_on_failure: bool,
}

fn default_max_swaps() -> u32 {
    2
}

fn default_settle_delay_ms() -> u64 {
    500
}

impl Default for RestartSection {
    fn default() -> Self {
        Self {
            max_swaps: default_max_swaps(),
            settle_delay_ms: default_settle_delay_ms(),
            restart_on_failure: false,
        }
    }
}

/// Where plan documents live and how often they are polled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSection {
    /// Relative to each task's work dir.
    #[serde(default = "default_specs_dir")]
    pub specs_dir: PathBuf,
    #[serde(default = "default_plan_file_name")]
    pub file_name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_specs_dir() -> PathBuf {
    PathBuf::from(BOARD_DIR).join("specs")
}

fn default_plan_file_name() -> String {
    "implementation_plan.json".to_string()
}

/// Floor for `plan.poll_interval_ms`; lower values, including 0, are raised to it.
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for PlanSection {
    fn default() -> Self {
        Self {
            specs_dir: default_specs_dir(),
            file_name: default_plan_file_name(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PlanSection {
    /// The task's explicit plan path, or `<work_dir>/<specs_dir>/<spec_id>/<file_name>`.
    pub fn plan_path_for(&self, task: &Task) -> PathBuf {
        task.plan_path.clone().unwrap_or_else(|| {
            task.work_dir
                .join(&self.specs_dir)
                .join(&task.spec_id)
                .join(&self.file_name)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessSection {
    /// How long a running task may go without a live worker before it is
    /// reported as stuck.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_grace_period_secs() -> u64 {
    30
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a locally served UI.
    #[serde(default)]
    pub cors: bool,
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write logs to this file (relative to the board dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// The complete board.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardToml {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub restart: RestartSection,
    #[serde(default)]
    pub plan: PlanSection,
    #[serde(default)]
    pub liveness: LivenessSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl BoardToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse board.toml")
    }

    /// Load `board.toml` from the board directory, or defaults if it doesn't exist.
    pub fn load_or_default(board_dir: &Path) -> Result<Self> {
        let config_path = board_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize board.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        match &self.worker.scripts_dir {
            None => warnings.push(
                "worker.scripts_dir is not set; workers cannot be spawned until it is".to_string(),
            ),
            Some(dir) if !dir.is_dir() => warnings.push(format!(
                "worker.scripts_dir '{}' does not exist",
                dir.display()
            )),
            Some(_) => {}
        }
        if self.worker.program.trim().is_empty() {
            warnings.push("worker.program is empty".to_string());
        }
        if self.restart.max_swaps == 0 {
            warnings.push("restart.max_swaps is 0; automatic restarts are disabled".to_string());
        }
        if self.plan.poll_interval_ms < 50 {
            warnings.push(format!(
                "plan.poll_interval_ms {} is very low; plan files will be read constantly",
                self.plan.poll_interval_ms
            ));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings
    }
}

/// Resolved configuration: board.toml plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub project_dir: PathBuf,
    pub board_dir: PathBuf,
    pub toml: BoardToml,
    pub cli_worker_program: Option<String>,
    pub cli_scripts_dir: Option<PathBuf>,
    pub cli_port: Option<u16>,
}

impl BoardConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let board_dir = project_dir.join(BOARD_DIR);
        let toml = BoardToml::load_or_default(&board_dir)?;
        Ok(Self::from_toml(project_dir, toml))
    }

    /// Build from an already-parsed file without touching the filesystem.
    pub fn from_toml(project_dir: PathBuf, toml: BoardToml) -> Self {
        let board_dir = project_dir.join(BOARD_DIR);
        Self {
            project_dir,
            board_dir,
            toml,
            cli_worker_program: None,
            cli_scripts_dir: None,
            cli_port: None,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.board_dir.join(CONFIG_FILE)
    }

    /// Worker program (CLI → env → file).
    pub fn worker_program(&self) -> String {
        self.cli_worker_program
            .clone()
            .or_else(|| std::env::var("AGENTBOARD_WORKER_PROGRAM").ok())
            .unwrap_or_else(|| self.toml.worker.program.clone())
    }

    /// Worker scripts directory (CLI → env → file). Relative paths resolve
    /// against the project directory.
    pub fn scripts_dir(&self) -> Option<PathBuf> {
        self.cli_scripts_dir
            .clone()
            .or_else(|| std::env::var("AGENTBOARD_SCRIPTS_DIR").ok().map(PathBuf::from))
            .or_else(|| self.toml.worker.scripts_dir.clone())
            .map(|dir| {
                if dir.is_absolute() {
                    dir
                } else {
                    self.project_dir.join(dir)
                }
            })
    }

    pub fn port(&self) -> u16 {
        self.cli_port.unwrap_or(self.toml.server.port)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.toml.restart.settle_delay_ms)
    }

    /// Plan poll period, never shorter than [`MIN_POLL_INTERVAL_MS`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.toml.plan.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.toml.liveness.grace_period_secs)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.toml.logging.file.as_ref().map(|f| {
            if f.is_absolute() {
                f.clone()
            } else {
                self.board_dir.join(f)
            }
        })
    }
}
