//! Stacks: compose files deployed to the swarm through the CLI.

use async_trait::async_trait;

use crate::bridge::CliClient;
use crate::client::DockerClient;
use crate::engine::{STACK_NAMESPACE_LABEL, ServiceInfo, TaskInfo};
use crate::error::{FixtureError, Result};
use crate::provision::{Reclaim, ResourceHandle, ResourceKind};

/// Compose file used when a deploy names none.
pub const DEFAULT_COMPOSE_FILE: &str = "compose.yml";

/// A deployed stack.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    compose_file: Option<String>,
    client: DockerClient,
}

impl Stack {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compose file this stack was deployed from, when known.
    ///
    /// Stacks found through [`StackCollection::get`] or
    /// [`StackCollection::list`] do not know it.
    pub fn compose_file(&self) -> Option<&str> {
        self.compose_file.as_deref()
    }

    /// `com.docker.stack.namespace=<name>`.
    pub fn namespace_filter(&self) -> String {
        format!("{STACK_NAMESPACE_LABEL}={}", self.name)
    }

    /// Services of this stack, queried live.
    pub async fn services(&self) -> Result<Vec<ServiceInfo>> {
        Ok(self
            .client
            .engine()
            .list_services(&self.namespace_filter())
            .await?)
    }

    /// Tasks of this stack, queried live.
    pub async fn tasks(&self) -> Result<Vec<TaskInfo>> {
        Ok(self
            .client
            .engine()
            .list_tasks(&self.namespace_filter())
            .await?)
    }

    /// Remove the stack.
    pub async fn remove(&self) -> Result<()> {
        self.client.cli().remove_stack(&self.name).await
    }

    /// Handle for registering the stack with a session.
    pub fn handle(&self) -> ResourceHandle {
        ResourceHandle::owned(ResourceKind::Stack, &self.name, &self.name)
    }
}

/// Stacks known to the engine.
pub struct StackCollection<'a> {
    client: &'a DockerClient,
}

impl<'a> StackCollection<'a> {
    pub fn new(client: &'a DockerClient) -> Self {
        Self { client }
    }

    /// Deploy `compose_file` (default `compose.yml`) as stack `name`.
    pub async fn deploy(&self, name: &str, compose_file: Option<&str>) -> Result<Stack> {
        let compose_file = compose_file.unwrap_or(DEFAULT_COMPOSE_FILE);
        let record = self
            .client
            .cli()
            .deploy_stack(name, compose_file)
            .await?;
        Ok(Stack {
            name: record.name,
            compose_file: Some(compose_file.to_string()),
            client: self.client.clone(),
        })
    }

    /// The stack called `name`.
    pub async fn get(&self, name: &str) -> Result<Stack> {
        self.client
            .cli()
            .list_stacks()
            .await?
            .into_iter()
            .find(|record| record.name == name)
            .map(|record| self.stack(record.name))
            .ok_or_else(|| FixtureError::NotFound {
                kind: ResourceKind::Stack,
                name: name.to_string(),
            })
    }

    pub async fn list(&self) -> Result<Vec<Stack>> {
        Ok(self
            .client
            .cli()
            .list_stacks()
            .await?
            .into_iter()
            .map(|record| self.stack(record.name))
            .collect())
    }

    fn stack(&self, name: String) -> Stack {
        Stack {
            name,
            compose_file: None,
            client: self.client.clone(),
        }
    }
}

/// Removes stacks on behalf of a session.
#[derive(Debug, Clone)]
pub(crate) struct StackReclaimer {
    cli: CliClient,
}

impl StackReclaimer {
    pub(crate) fn new(cli: CliClient) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl Reclaim for StackReclaimer {
    async fn exists(&self, handle: &ResourceHandle) -> Result<bool> {
        Ok(self
            .cli
            .list_stacks()
            .await?
            .iter()
            .any(|record| record.name == handle.name))
    }

    async fn remove(&self, handle: &ResourceHandle) -> Result<()> {
        match self.cli.remove_stack(&handle.name).await {
            Err(FixtureError::Subprocess { stderr, .. })
                if stderr.to_ascii_lowercase().contains("nothing found in stack") =>
            {
                Ok(())
            }
            other => other,
        }
    }
}
