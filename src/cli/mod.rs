//! CLI command handling.
//!
//! Provides subcommands for:
//! - Engine version and availability (`version`, `check`)
//! - Generating resource names (`name`)
//! - Resolving the image under test (`image`)
//! - Printing the fixture parameter matrix (`matrix`)
//! - Managing stacks (`stack ls`, `stack deploy`, `stack rm`, `stack services`, `stack tasks`)

mod stack;

pub use stack::{StackCommand, run_stack_command};

use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand};

use crate::bridge::CliClient;
use crate::config::Settings;
use crate::config::matrix::{
    LogHandlerKind, OrchestratorKind, SERVICE_REPLICAS, SecretMode, container_matrix,
};
use crate::engine::connect_engine_with;
use crate::engine::detect::check_docker;
use crate::error::ConfigError;
use crate::naming::random_name;
use crate::provision::resolve_image;

#[derive(Parser, Debug)]
#[command(name = "container-fixtures")]
#[command(about = "Ephemeral Docker infrastructure for integration tests")]
#[command(
    long_about = "Inspect and manage the Docker resources test fixtures use.\nExamples:\n  container-fixtures check  # Is Docker usable?\n  container-fixtures stack ls  # List deployed stacks"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Settings file (defaults to fixtures.toml when present)
    #[arg(short, long, global = true, env = "FIXTURES_SETTINGS")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show client and server version of the engine
    #[command(
        about = "Show engine version",
        long_about = "Runs `docker version` through the CLI bridge and prints the JSON.\nExample: container-fixtures version"
    )]
    Version,

    /// Check that the docker binary is installed and the daemon answers
    #[command(
        about = "Check Docker availability",
        long_about = "Checks the docker binary and the daemon, with install or start hints.\nExample: container-fixtures check"
    )]
    Check,

    /// Generate collision-resistant resource names
    #[command(
        about = "Generate resource names",
        long_about = "Prints names in the pytest[_<base>]_<hex> format.\nExample: container-fixtures name python-hello --count 3"
    )]
    Name {
        /// Base inserted after the prefix
        base: Option<String>,

        /// How many names to print
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Show the image under test
    #[command(
        about = "Resolve the image under test",
        long_about = "Prints the image reference built from the settings; --pull inspects it on the engine, pulling if missing.\nExample: container-fixtures image --pull"
    )]
    Image {
        /// Inspect the image on the engine, pulling it if needed
        #[arg(long)]
        pull: bool,
    },

    /// Print the fixture parameter matrix
    #[command(
        about = "Print parameter ids",
        long_about = "Lists every parameter id fixtures are run with.\nExample: container-fixtures matrix"
    )]
    Matrix,

    /// Manage stacks
    #[command(
        subcommand,
        about = "Manage stacks",
        long_about = "List, deploy and remove stacks, and show their services and tasks.\nExample: container-fixtures stack deploy demo --compose-file compose.yml"
    )]
    Stack(StackCommand),
}

impl Cli {
    /// Settings from `--config`, or resolved from the environment.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        match &self.config {
            Some(path) => {
                let _ = dotenvy::dotenv();
                Settings::from_file(path)
            }
            None => Settings::resolve(),
        }
    }
}

/// Run one command to completion.
pub async fn run_command(command: Command, settings: Settings) -> anyhow::Result<()> {
    match command {
        Command::Version => {
            let version = CliClient::from_settings(&settings).version().await?;
            println!("{}", serde_json::to_string_pretty(&version)?);
            Ok(())
        }
        Command::Check => run_check_command(&settings).await,
        Command::Name { base, count } => {
            for name in generate_names(base.as_deref(), count) {
                println!("{name}");
            }
            Ok(())
        }
        Command::Image { pull } => run_image_command(&settings, pull).await,
        Command::Matrix => {
            for line in matrix_lines() {
                println!("{line}");
            }
            Ok(())
        }
        Command::Stack(cmd) => run_stack_command(cmd, &settings).await,
    }
}

async fn run_check_command(settings: &Settings) -> anyhow::Result<()> {
    let detection = check_docker(&settings.docker_cli).await;
    println!("docker: {}", detection.status.as_str());
    if !detection.status.is_ok() {
        println!("{}", detection.hint());
        anyhow::bail!("Docker is {}", detection.status.as_str());
    }
    Ok(())
}

async fn run_image_command(settings: &Settings, pull: bool) -> anyhow::Result<()> {
    let reference = settings.image_reference();
    if !pull {
        println!("{reference}");
        return Ok(());
    }

    let engine = connect_engine_with(CliClient::from_settings(settings)).await?;
    let image = resolve_image(engine.as_ref(), &reference).await?;
    println!("{}", image.primary_tag());
    println!("  id: {}", image.id);
    for volume in &image.volumes {
        println!("  volume: {volume}");
    }
    if let Some(ns) = image.health_start_period_ns {
        println!("  health start period: {}s", ns / 1_000_000_000);
    }
    Ok(())
}

fn generate_names(base: Option<&str>, count: usize) -> Vec<String> {
    (0..count).map(|_| random_name(base)).collect()
}

/// Every parameter id, one per line, grouped by fixture.
fn matrix_lines() -> Vec<String> {
    let mut lines = Vec::new();
    lines.extend(OrchestratorKind::ALL.iter().map(|o| o.param_id()));
    lines.extend(SecretMode::ALL.iter().map(|s| s.param_id()));
    lines.extend(LogHandlerKind::ALL.iter().map(|h| h.param_id()));
    lines.extend(SERVICE_REPLICAS.iter().map(|r| format!("replicas={r}")));
    lines.extend(container_matrix().iter().map(|case| case.param_id()));
    lines
}
