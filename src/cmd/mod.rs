//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `serve`  | `Serve`          |
//! | `config` | `Config`         |

pub mod config;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use run::cmd_run;
pub use serve::cmd_serve;

use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;

use agentboard::config::BoardConfig;

use super::Cli;

/// Load `board.toml` for `project_dir` and apply the global CLI overrides.
pub fn load_config(cli: &Cli, project_dir: PathBuf) -> Result<BoardConfig> {
    let mut config = BoardConfig::new(project_dir)?;
    config.cli_worker_program = cli.worker_program.clone();
    config.cli_scripts_dir = cli.scripts_dir.clone();
    Ok(config)
}

pub fn init_logging(cli: &Cli, config: &BoardConfig) -> Result<Option<WorkerGuard>> {
    let log_file = config.log_file();
    agentboard::logging::init_logging(&config.toml.logging, log_file.as_deref(), cli.verbose)
}
