//! HTTP server command — `agentboard serve`.

use std::path::PathBuf;

use anyhow::Result;

use super::super::Cli;
use super::{init_logging, load_config};

pub async fn cmd_serve(cli: &Cli, project_dir: PathBuf, port: Option<u16>) -> Result<()> {
    let mut config = load_config(cli, project_dir)?;
    config.cli_port = port;
    let _guard = init_logging(cli, &config)?;

    for warning in config.toml.validate() {
        tracing::warn!("board.toml: {}", warning);
    }

    agentboard::board::server::start_server(config).await
}
