//! The container engine seen through the operations fixtures need.
//!
//! [`Engine`] covers images, networks, volumes, containers, swarm, services
//! and tasks. [`DockerEngine`] implements it over the Docker HTTP API, with
//! swarm membership and task listing going through the `docker` CLI; tests
//! use [`FakeEngine`](crate::testing::FakeEngine) instead.

pub mod detect;
mod docker;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::bridge::CliClient;

pub use docker::{DockerEngine, connect_docker};

/// Label attached to every resource a session creates.
pub const TRACKING_LABEL: &str = "pytest_fixture";

/// Label that groups the services and tasks of a stack.
pub const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

/// Errors reported by an [`Engine`].
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The object does not exist.
    #[error("{what} not found")]
    NotFound {
        /// Description of what was looked up.
        what: String,
    },

    /// `swarm init` on a node that already belongs to a swarm.
    #[error("node is already part of a swarm")]
    AlreadyInSwarm,

    /// The daemon cannot be reached.
    #[error("Docker not available: {reason}")]
    Unavailable {
        /// Reason why Docker is unavailable.
        reason: String,
    },

    /// The daemon answered with an error status.
    #[error("engine returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message from the daemon.
        message: String,
    },

    /// The request never got an answer.
    #[error("engine request failed: {0}")]
    Transport(String),

    /// A `docker` CLI invocation failed.
    #[error("docker CLI failed: {0}")]
    Cli(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Metadata of an image, as far as fixtures care.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub id: String,
    /// Reference the image was looked up with.
    pub reference: String,
    pub repo_tags: Vec<String>,
    /// Mount points declared with `VOLUME`, sorted.
    pub volumes: Vec<String>,
    /// `HEALTHCHECK --start-period` in nanoseconds, if declared.
    pub health_start_period_ns: Option<i64>,
}

impl ImageMetadata {
    /// First repo tag, falling back to the lookup reference.
    pub fn primary_tag(&self) -> &str {
        self.repo_tags
            .first()
            .map(String::as_str)
            .unwrap_or(&self.reference)
    }
}

/// A network known to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub attachable: bool,
}

/// Parameters for creating a network.
#[derive(Debug, Clone, Default)]
pub struct NetworkCreate {
    pub name: String,
    pub driver: String,
    pub attachable: bool,
    pub labels: HashMap<String, String>,
}

/// Parameters for creating a volume.
#[derive(Debug, Clone, Default)]
pub struct VolumeCreate {
    pub name: String,
    pub driver: String,
    pub labels: HashMap<String, String>,
}

/// Parameters for creating and starting a detached container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerCreate {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub hostname: Option<String>,
    /// `None` attaches to the default bridge.
    pub network_mode: Option<String>,
    /// `source:target` bind specifications.
    pub binds: Vec<String>,
    pub volumes_from: Vec<String>,
    /// `name:alias` legacy links.
    pub links: Vec<String>,
    /// `host:ip` entries for `/etc/hosts`.
    pub extra_hosts: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Live view of a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    /// Name without the leading `/`.
    pub name: String,
    pub status: Option<String>,
    pub image: Option<String>,
    /// `HostConfig.NetworkMode`.
    pub network_mode: Option<String>,
    /// Attached networks: name → network id.
    pub networks: BTreeMap<String, String>,
}

/// Parameters for creating a replicated swarm service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceCreate {
    pub name: String,
    pub image: String,
    pub replicas: u64,
    pub networks: Vec<String>,
    pub constraints: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Live view of a swarm service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub replicas: Option<u64>,
    pub labels: HashMap<String, String>,
}

/// Live view of a swarm task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInfo {
    pub id: String,
    pub service_id: Option<String>,
    pub state: Option<String>,
    pub desired_state: Option<String>,
    pub container_id: Option<String>,
}

/// Engine operations used by provisioners and stacks.
///
/// Lookups of absent objects fail with [`EngineError::NotFound`]; the
/// provided `*_exists` methods turn that into `false`.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageMetadata, EngineError>;
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Networks whose name matches `name` (the engine may match substrings).
    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkInfo>, EngineError>;
    async fn inspect_network(&self, id_or_name: &str) -> Result<NetworkInfo, EngineError>;
    async fn create_network(&self, request: &NetworkCreate) -> Result<NetworkInfo, EngineError>;
    async fn remove_network(&self, id: &str) -> Result<(), EngineError>;

    async fn create_volume(&self, request: &VolumeCreate) -> Result<String, EngineError>;
    async fn inspect_volume(&self, name: &str) -> Result<(), EngineError>;
    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    /// Create and start a detached container, returning its id.
    async fn run_container(&self, request: &ContainerCreate) -> Result<String, EngineError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, EngineError>;
    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), EngineError>;

    /// Initialize a single-node swarm, returning the node id.
    async fn init_swarm(&self) -> Result<String, EngineError>;
    async fn swarm_active(&self) -> Result<bool, EngineError>;
    async fn leave_swarm(&self, force: bool) -> Result<(), EngineError>;

    async fn create_service(&self, request: &ServiceCreate) -> Result<String, EngineError>;
    async fn inspect_service(&self, id: &str) -> Result<ServiceInfo, EngineError>;
    async fn remove_service(&self, id: &str) -> Result<(), EngineError>;
    /// Services carrying the `key=value` label.
    async fn list_services(&self, label: &str) -> Result<Vec<ServiceInfo>, EngineError>;
    /// Tasks carrying the `key=value` label.
    async fn list_tasks(&self, label: &str) -> Result<Vec<TaskInfo>, EngineError>;

    async fn network_exists(&self, id: &str) -> Result<bool, EngineError> {
        absent_as_false(self.inspect_network(id).await.map(|_| ()))
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        absent_as_false(self.inspect_volume(name).await)
    }

    async fn container_exists(&self, id: &str) -> Result<bool, EngineError> {
        absent_as_false(self.inspect_container(id).await.map(|_| ()))
    }

    async fn service_exists(&self, id: &str) -> Result<bool, EngineError> {
        absent_as_false(self.inspect_service(id).await.map(|_| ()))
    }
}

fn absent_as_false(result: Result<(), EngineError>) -> Result<bool, EngineError> {
    match result {
        Ok(()) => Ok(true),
        Err(EngineError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Shared handle to an engine.
pub type SharedEngine = Arc<dyn Engine>;

/// Connect to the local Docker daemon.
pub async fn connect_engine() -> Result<SharedEngine, EngineError> {
    connect_engine_with(CliClient::new()).await
}

/// [`connect_engine`], running swarm commands through `cli`.
pub async fn connect_engine_with(cli: CliClient) -> Result<SharedEngine, EngineError> {
    let docker = connect_docker().await?;
    Ok(Arc::new(DockerEngine::new(docker, cli)))
}

/// The tracking label as a single-entry map.
pub(crate) fn tracking_labels() -> HashMap<String, String> {
    HashMap::from([(TRACKING_LABEL.to_string(), String::new())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_tag_falls_back_to_reference() {
        let image = ImageMetadata {
            reference: "busybox:latest".to_string(),
            ..Default::default()
        };
        assert_eq!(image.primary_tag(), "busybox:latest");

        let image = ImageMetadata {
            reference: "sha256:abc".to_string(),
            repo_tags: vec!["google/python-hello:latest".to_string()],
            ..Default::default()
        };
        assert_eq!(image.primary_tag(), "google/python-hello:latest");
    }

    #[test]
    fn test_absent_as_false() {
        assert!(absent_as_false(Ok(())).unwrap());
        assert!(
            !absent_as_false(Err(EngineError::NotFound {
                what: "x".to_string()
            }))
            .unwrap()
        );
        assert!(absent_as_false(Err(EngineError::Transport("eof".to_string()))).is_err());
    }
}
