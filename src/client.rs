//! One handle on both halves of the engine: the HTTP API and the CLI.

use std::sync::Arc;

use crate::bridge::CliClient;
use crate::config::Settings;
use crate::engine::{Engine, SharedEngine, connect_engine_with};
use crate::error::Result;
use crate::stack::StackCollection;

/// Engine API plus CLI bridge.
#[derive(Clone)]
pub struct DockerClient {
    engine: SharedEngine,
    cli: CliClient,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient")
            .field("cli", &self.cli)
            .finish_non_exhaustive()
    }
}

impl DockerClient {
    pub fn new(engine: SharedEngine, cli: CliClient) -> Self {
        Self { engine, cli }
    }

    /// Wrap any engine implementation.
    pub fn with_engine(engine: impl Engine + 'static, cli: CliClient) -> Self {
        Self::new(Arc::new(engine), cli)
    }

    /// Connect to the local daemon and configure the CLI from `settings`.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let cli = CliClient::from_settings(settings);
        let engine = connect_engine_with(cli.clone()).await?;
        Ok(Self::new(engine, cli))
    }

    /// [`DockerClient::connect`] with settings resolved from the environment.
    pub async fn from_env() -> Result<Self> {
        Self::connect(&Settings::resolve()?).await
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    pub fn cli(&self) -> &CliClient {
        &self.cli
    }

    pub fn stacks(&self) -> StackCollection<'_> {
        StackCollection::new(self)
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.engine.ping().await?)
    }

    /// `docker version` as JSON.
    pub async fn version(&self) -> Result<serde_json::Value> {
        self.cli.version().await
    }
}
