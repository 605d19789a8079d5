use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ddosmon::config::Config;
use ddosmon::runtime::{run_daemon, EXIT_CONFIG_ERROR, EXIT_OK};

#[derive(Parser)]
#[command(name = "ddosmon")]
#[command(author, version, about = "Flow-telemetry DDoS detection daemon")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the detection daemon
    Start,

    /// Validate the configuration and exit
    CheckConfig,
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Config::load_or_default().context("Loading configuration"),
    }
}

/// Run a command and return the process exit code.
pub async fn run_command(cli: Cli) -> i32 {
    match cli.command {
        Commands::Start => {
            let config = match load_config(&cli.config) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("Configuration error: {:#}", err);
                    return EXIT_CONFIG_ERROR;
                }
            };
            run_daemon(config, cli.config).await
        }

        Commands::CheckConfig => match load_config(&cli.config) {
            Ok(_) => {
                println!("Configuration OK");
                EXIT_OK
            }
            Err(err) => {
                eprintln!("Configuration error: {:#}", err);
                EXIT_CONFIG_ERROR
            }
        },
    }
}
