use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "agentboard")]
#[command(version, about = "Runs coding-agent workers and tracks task status")]
pub struct Cli {
    /// Log at debug level (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Interpreter used to launch worker scripts. Overrides board.toml and
    /// AGENTBOARD_WORKER_PROGRAM.
    #[arg(long, global = true)]
    pub worker_program: Option<String>,

    /// Directory holding the worker scripts. Overrides board.toml and
    /// AGENTBOARD_SCRIPTS_DIR.
    #[arg(long, global = true)]
    pub scripts_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one task headless and stream its events as JSON lines
    Run {
        /// Spec identifier; also names the plan directory
        #[arg(long)]
        spec_id: String,

        /// Directory the worker operates in (defaults to the project dir)
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Work item description handed to the definition worker
        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        title: Option<String>,

        /// Stop in human review once the plan is written
        #[arg(long)]
        require_plan_review: bool,

        /// Go straight to human review when all subtasks complete
        #[arg(long)]
        skip_ai_review: bool,
    },
    /// Serve the board over HTTP with a WebSocket event stream
    Serve {
        /// Port to serve on (defaults to [server] port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default board.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            spec_id,
            work_dir,
            description,
            title,
            require_plan_review,
            skip_ai_review,
        } => {
            let args = cmd::run::RunArgs {
                spec_id: spec_id.clone(),
                work_dir: work_dir.clone(),
                description: description.clone(),
                title: title.clone(),
                require_plan_review: *require_plan_review,
                skip_ai_review: *skip_ai_review,
            };
            cmd::cmd_run(&cli, project_dir, args).await?;
        }
        Commands::Serve { port } => cmd::cmd_serve(&cli, project_dir, *port).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, &project_dir, command.clone())?,
    }

    Ok(())
}
