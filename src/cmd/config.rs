//! Configuration view and validation commands — `agentboard config`.

use std::path::Path;

use anyhow::Result;

use agentboard::config::{BOARD_DIR, BoardToml, CONFIG_FILE};

use super::super::{Cli, ConfigCommands};
use super::load_config;

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let board_dir = project_dir.join(BOARD_DIR);
    let config_path = board_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Agentboard Configuration");
            println!("========================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                BoardToml::load(&config_path)?
            } else {
                println!("No board.toml found at {}", config_path.display());
                println!("Using default configuration.");
                BoardToml::default()
            };
            println!();
            print!("{}", toml::to_string_pretty(&toml)?);
            println!();

            println!("Effective values (with env/CLI overrides):");
            let config = load_config(cli, project_dir.to_path_buf())?;
            println!("  worker program = \"{}\"", config.worker_program());
            match config.scripts_dir() {
                Some(dir) => println!("  scripts dir = \"{}\"", dir.display()),
                None => println!("  scripts dir = (not set)"),
            }
            println!("  port = {}", config.port());
            println!();

            if !config_path.exists() {
                println!("Run 'agentboard config init' to create a board.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No board.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = BoardToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("board.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&board_dir)?;
            BoardToml::default().save(&config_path)?;

            println!("Created board.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [worker] program, scripts_dir, definition_script, run_script");
            println!("  - [restart] max_swaps, settle_delay_ms, restart_on_failure");
            println!("  - [plan] specs_dir, file_name, poll_interval_ms");
            println!();
        }
    }

    Ok(())
}
