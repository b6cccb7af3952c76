use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use meetloop::config::PanelConfig;
use meetloop::models::Lane;

mod cmd;

#[derive(Parser)]
#[command(name = "meetloop")]
#[command(version, about = "Control panel for the Meet → Analyze → Build → Verify loop")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Pipeline server base URL. Overrides meetloop.toml and MEETLOOP_BASE_URL.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the whole loop for one meeting without interaction
    Run {
        /// Meeting name
        #[arg(short, long, default_value = "Untitled meeting")]
        meeting: String,

        /// Transcript file. Without one the server analyzes its latest meeting.
        #[arg(short, long)]
        transcript: Option<PathBuf>,

        /// Executor for every gap: cloud, local, developer
        #[arg(short, long)]
        executor: Option<Lane>,

        /// Verify rounds, including fix-and-rebuild passes
        #[arg(long, default_value = "3")]
        max_rounds: u32,

        /// Stop after dispatch
        #[arg(long)]
        skip_verify: bool,
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
    /// Initialize a default meetloop.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match cli.command {
        Commands::Run {
            meeting,
            transcript,
            executor,
            max_rounds,
            skip_verify,
        } => {
            let config =
                PanelConfig::with_cli_args(project_dir, cli.verbose, cli.base_url, executor)?;
            meetloop::logging::init(&config.toml.logging, config.verbose);
            for warning in config.validate() {
                tracing::warn!("{}", warning);
            }
            cmd::cmd_run(
                config,
                cmd::RunArgs {
                    meeting,
                    transcript,
                    executor,
                    max_rounds,
                    skip_verify,
                },
            )
            .await?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command)?,
    }

    Ok(())
}
