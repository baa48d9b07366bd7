//! `docker swarm`, `docker info` and `docker service ps` over the CLI bridge.

use serde::Deserialize;

use crate::bridge::CliClient;
use crate::bridge::stack::parse_json_lines;
use crate::error::{FixtureError, Result};

/// Address a single-node swarm advertises.
pub const SWARM_ADVERTISE_ADDR: &str = "127.0.0.1";

/// `docker info --format '{{json .Swarm}}'`, the fields fixtures read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SwarmRecord {
    #[serde(rename = "NodeID", default)]
    pub node_id: String,
    /// `inactive`, `pending`, `active`, `error` or `locked`.
    #[serde(default)]
    pub local_node_state: String,
    #[serde(default)]
    pub control_available: bool,
}

impl SwarmRecord {
    pub fn is_active(&self) -> bool {
        self.local_node_state == "active"
    }
}

/// One row of `docker service ps --format '{{json .}}'`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskRecord {
    #[serde(rename = "ID")]
    pub id: String,
    /// `<service>.<slot>`.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desired_state: String,
    /// e.g. `Running 5 minutes ago`.
    #[serde(default)]
    pub current_state: String,
    #[serde(default)]
    pub error: String,
}

impl TaskRecord {
    /// First word of the current state, lowercased (`running`).
    pub fn state(&self) -> Option<String> {
        first_word(&self.current_state)
    }

    pub fn desired(&self) -> Option<String> {
        first_word(&self.desired_state)
    }
}

fn first_word(text: &str) -> Option<String> {
    text.split_whitespace().next().map(str::to_ascii_lowercase)
}

impl CliClient {
    /// Swarm state of the local node.
    pub async fn swarm_info(&self) -> Result<SwarmRecord> {
        let output = self
            .dispatch(&["info", "--format", "{{json .Swarm}}"], 0)
            .await?;
        let trimmed = output.stdout.trim();
        serde_json::from_str(trimmed).map_err(|e| FixtureError::Parse {
            line: trimmed.to_string(),
            reason: e.to_string(),
        })
    }

    /// Make the local node the manager of a new single-node swarm, returning
    /// its node id.
    pub async fn init_swarm(&self) -> Result<String> {
        tracing::info!("docker swarm init --advertise-addr {}", SWARM_ADVERTISE_ADDR);
        self.dispatch(&["swarm", "init", "--advertise-addr", SWARM_ADVERTISE_ADDR], 0)
            .await?;
        Ok(self.swarm_info().await?.node_id)
    }

    pub async fn leave_swarm(&self, force: bool) -> Result<()> {
        tracing::info!("docker swarm leave{}", if force { " --force" } else { "" });
        let mut args = vec!["swarm", "leave"];
        if force {
            args.push("--force");
        }
        self.dispatch(&args, 0).await?;
        Ok(())
    }

    /// Tasks of one service, like `docker service ps`.
    pub async fn service_tasks(&self, service: &str) -> Result<Vec<TaskRecord>> {
        let output = self
            .dispatch(
                &["service", "ps", "--no-trunc", "--format", "{{json .}}", service],
                0,
            )
            .await?;
        parse_json_lines(&output.stdout)
    }
}
