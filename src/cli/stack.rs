//! Stack CLI commands.

use clap::Subcommand;

use crate::client::DockerClient;
use crate::config::Settings;
use crate::stack::DEFAULT_COMPOSE_FILE;

#[derive(Subcommand, Debug, Clone)]
pub enum StackCommand {
    /// List deployed stacks
    Ls,

    /// Deploy a compose file as a stack
    Deploy {
        /// Stack name
        name: String,

        /// Compose file to deploy
        #[arg(short = 'f', long, default_value = DEFAULT_COMPOSE_FILE)]
        compose_file: String,
    },

    /// Remove a stack
    Rm {
        /// Stack name
        name: String,
    },

    /// List the services of a stack
    Services {
        /// Stack name
        name: String,
    },

    /// List the tasks of a stack
    Tasks {
        /// Stack name
        name: String,
    },
}

/// Run a stack command.
pub async fn run_stack_command(cmd: StackCommand, settings: &Settings) -> anyhow::Result<()> {
    let client = DockerClient::connect(settings).await?;
    let stacks = client.stacks();

    match cmd {
        StackCommand::Ls => {
            let records = client.cli().list_stacks().await?;
            if records.is_empty() {
                println!("No stacks deployed.");
            }
            for record in records {
                println!(
                    "{}\t{}\t{}",
                    record.name,
                    record.services.as_deref().unwrap_or("-"),
                    record.orchestrator.as_deref().unwrap_or("-")
                );
            }
        }
        StackCommand::Deploy { name, compose_file } => {
            let stack = stacks.deploy(&name, Some(&compose_file)).await?;
            println!("Deployed stack {} from {}", stack.name(), compose_file);
        }
        StackCommand::Rm { name } => {
            stacks.get(&name).await?.remove().await?;
            println!("Removed stack {name}");
        }
        StackCommand::Services { name } => {
            for service in stacks.get(&name).await?.services().await? {
                println!(
                    "{}\t{}\t{}",
                    service.id,
                    service.name,
                    service
                        .replicas
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        StackCommand::Tasks { name } => {
            for task in stacks.get(&name).await?.tasks().await? {
                println!(
                    "{}\t{}\t{}",
                    task.id,
                    task.state.as_deref().unwrap_or("-"),
                    task.desired_state.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}
