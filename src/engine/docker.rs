//! [`Engine`] over the Docker HTTP API.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    HostConfig, NetworkAttachmentConfig, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated,
    TaskSpec, TaskSpecContainerSpec, TaskSpecPlacement,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};
use bollard::service::ListServicesOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use futures::StreamExt;
use serde::Serialize;

use crate::bridge::CliClient;
use crate::engine::{
    ContainerCreate, ContainerInfo, Engine, EngineError, ImageMetadata, NetworkCreate,
    NetworkInfo, ServiceCreate, ServiceInfo, TaskInfo, VolumeCreate,
};
use crate::error::FixtureError;

/// Request timeout for sockets found by the fallback search, in seconds.
const SOCKET_TIMEOUT_SECS: u64 = 120;

impl From<BollardError> for EngineError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound { what: message },
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            other => EngineError::Transport(other.to_string()),
        }
    }
}

/// Connect to the Docker daemon.
///
/// Tries bollard's local defaults (`DOCKER_HOST`, `/var/run/docker.sock`,
/// the Windows named pipe) first, then the Docker Desktop and rootless
/// sockets under the user's home and runtime directories.
pub async fn connect_docker() -> Result<Docker, EngineError> {
    let default_error = match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let path = socket.to_string_lossy();
        if let Ok(docker) =
            Docker::connect_with_socket(&path, SOCKET_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            && docker.ping().await.is_ok()
        {
            tracing::debug!("Connected to Docker via {}", path);
            return Ok(docker);
        }
    }

    Err(EngineError::Unavailable {
        reason: default_error,
    })
}

fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = Vec::new();
    if let Some(home) = dirs::home_dir() {
        sockets.push(home.join(".docker/run/docker.sock"));
        sockets.push(home.join(".docker/desktop/docker.sock"));
    }
    if let Some(runtime) = dirs::runtime_dir() {
        sockets.push(runtime.join("docker.sock"));
    }
    sockets
}

/// Serialized name of a generated enum (`running`, `complete`, ...).
fn enum_name<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .filter(|s| !s.is_empty())
}

fn label_filter(label: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), vec![label.to_string()])])
}

/// Map a CLI bridge failure onto the engine's error vocabulary.
fn cli_error(err: FixtureError) -> EngineError {
    match err {
        FixtureError::Subprocess { ref stderr, .. } if stderr.contains("already part of a swarm") => {
            EngineError::AlreadyInSwarm
        }
        FixtureError::Subprocess { ref stderr, .. } if stderr.contains("not part of a swarm") => {
            EngineError::NotFound {
                what: "swarm".to_string(),
            }
        }
        other => EngineError::Cli(other.to_string()),
    }
}

/// Await `start`; when it fails, await `discard` before returning the
/// start error.
async fn start_or_discard<S, D>(start: S, discard: D) -> Result<(), EngineError>
where
    S: Future<Output = Result<(), EngineError>>,
    D: Future<Output = Result<(), EngineError>>,
{
    let Err(err) = start.await else {
        return Ok(());
    };
    if let Err(cleanup) = discard.await {
        tracing::warn!("Failed to discard container that did not start: {}", cleanup);
    }
    Err(err)
}

/// Docker daemon reached through bollard.
///
/// Swarm membership and task listing have no API binding here and go
/// through the CLI instead.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    cli: CliClient,
}

impl DockerEngine {
    pub fn new(docker: Docker, cli: CliClient) -> Self {
        Self { docker, cli }
    }

    fn network_info(network: bollard::models::Network) -> NetworkInfo {
        NetworkInfo {
            id: network.id.unwrap_or_default(),
            name: network.name.unwrap_or_default(),
            driver: network.driver.unwrap_or_default(),
            attachable: network.attachable.unwrap_or(false),
        }
    }

    fn service_info(service: bollard::models::Service) -> ServiceInfo {
        let spec = service.spec.unwrap_or_default();
        ServiceInfo {
            id: service.id.unwrap_or_default(),
            name: spec.name.unwrap_or_default(),
            replicas: spec
                .mode
                .and_then(|m| m.replicated)
                .and_then(|r| r.replicas)
                .and_then(|n| u64::try_from(n).ok()),
            labels: spec.labels.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map(|_| ()).map_err(Into::into)
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageMetadata, EngineError> {
        let image = self.docker.inspect_image(reference).await?;
        let config = image.config.unwrap_or_default();

        let mut volumes: Vec<String> = config.volumes.unwrap_or_default().into_keys().collect();
        volumes.sort();

        Ok(ImageMetadata {
            id: image.id.unwrap_or_default(),
            reference: reference.to_string(),
            repo_tags: image.repo_tags.unwrap_or_default(),
            volumes,
            health_start_period_ns: config.healthcheck.and_then(|h| h.start_period),
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(status) = info.status {
                tracing::trace!("Pull status: {}", status);
            }
        }
        Ok(())
    }

    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkInfo>, EngineError> {
        let options = ListNetworksOptions {
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
        };
        let networks = self.docker.list_networks(Some(options)).await?;
        Ok(networks.into_iter().map(Self::network_info).collect())
    }

    async fn inspect_network(&self, id_or_name: &str) -> Result<NetworkInfo, EngineError> {
        let network = self
            .docker
            .inspect_network(id_or_name, None::<InspectNetworkOptions<String>>)
            .await?;
        Ok(Self::network_info(network))
    }

    async fn create_network(&self, request: &NetworkCreate) -> Result<NetworkInfo, EngineError> {
        let options = CreateNetworkOptions {
            name: request.name.clone(),
            driver: request.driver.clone(),
            attachable: request.attachable,
            labels: request.labels.clone(),
            ..Default::default()
        };
        self.docker.create_network(options).await?;
        self.inspect_network(&request.name).await
    }

    async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
        self.docker.remove_network(id).await.map_err(Into::into)
    }

    async fn create_volume(&self, request: &VolumeCreate) -> Result<String, EngineError> {
        let options = CreateVolumeOptions {
            name: request.name.clone(),
            driver: request.driver.clone(),
            labels: request.labels.clone(),
            ..Default::default()
        };
        let volume = self.docker.create_volume(options).await?;
        Ok(volume.name)
    }

    async fn inspect_volume(&self, name: &str) -> Result<(), EngineError> {
        self.docker.inspect_volume(name).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: false }))
            .await
            .map_err(Into::into)
    }

    async fn run_container(&self, request: &ContainerCreate) -> Result<String, EngineError> {
        fn non_empty(v: &[String]) -> Option<Vec<String>> {
            if v.is_empty() { None } else { Some(v.to_vec()) }
        }

        let host_config = HostConfig {
            binds: non_empty(&request.binds),
            volumes_from: non_empty(&request.volumes_from),
            links: non_empty(&request.links),
            extra_hosts: non_empty(&request.extra_hosts),
            network_mode: request.network_mode.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(request.image.clone()),
            cmd: request.command.clone(),
            hostname: request.hostname.clone(),
            env: non_empty(&request.env),
            labels: Some(request.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.clone(),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        let id = response.id;
        start_or_discard(
            async {
                self.docker
                    .start_container(&id, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(EngineError::from)
            },
            async {
                tracing::warn!("Removing container {} that failed to start", request.name);
                self.remove_container(&id, true, true).await
            },
        )
        .await?;
        Ok(id)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, EngineError> {
        let info = self.docker.inspect_container(id, None).await?;

        let networks = info
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, endpoint)| (name, endpoint.network_id.unwrap_or_default()))
            .collect();

        Ok(ContainerInfo {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            status: info
                .state
                .and_then(|s| s.status)
                .and_then(|s| enum_name(&s)),
            image: info.config.and_then(|c| c.image),
            network_mode: info.host_config.and_then(|h| h.network_mode),
            networks,
        })
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: remove_volumes,
                    ..Default::default()
                }),
            )
            .await
            .map_err(Into::into)
    }

    async fn init_swarm(&self) -> Result<String, EngineError> {
        self.cli.init_swarm().await.map_err(cli_error)
    }

    async fn swarm_active(&self) -> Result<bool, EngineError> {
        let info = self.cli.swarm_info().await.map_err(cli_error)?;
        Ok(info.is_active())
    }

    async fn leave_swarm(&self, force: bool) -> Result<(), EngineError> {
        self.cli.leave_swarm(force).await.map_err(cli_error)
    }

    async fn create_service(&self, request: &ServiceCreate) -> Result<String, EngineError> {
        let networks: Vec<NetworkAttachmentConfig> = request
            .networks
            .iter()
            .map(|n| NetworkAttachmentConfig {
                target: Some(n.clone()),
                ..Default::default()
            })
            .collect();

        let spec = ServiceSpec {
            name: Some(request.name.clone()),
            labels: Some(request.labels.clone()),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated {
                    replicas: Some(i64::try_from(request.replicas).unwrap_or(i64::MAX)),
                }),
                ..Default::default()
            }),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(request.image.clone()),
                    env: if request.env.is_empty() {
                        None
                    } else {
                        Some(request.env.clone())
                    },
                    ..Default::default()
                }),
                placement: Some(TaskSpecPlacement {
                    constraints: Some(request.constraints.clone()),
                    ..Default::default()
                }),
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self.docker.create_service(spec, None).await?;
        match response.id {
            Some(id) => Ok(id),
            None => self.inspect_service(&request.name).await.map(|s| s.id),
        }
    }

    async fn inspect_service(&self, id: &str) -> Result<ServiceInfo, EngineError> {
        let service = self.docker.inspect_service(id, None).await?;
        Ok(Self::service_info(service))
    }

    async fn remove_service(&self, id: &str) -> Result<(), EngineError> {
        self.docker.delete_service(id).await.map_err(Into::into)
    }

    async fn list_services(&self, label: &str) -> Result<Vec<ServiceInfo>, EngineError> {
        let options = ListServicesOptions {
            filters: label_filter(label),
            ..Default::default()
        };
        let services = self.docker.list_services(Some(options)).await?;
        Ok(services.into_iter().map(Self::service_info).collect())
    }

    async fn list_tasks(&self, label: &str) -> Result<Vec<TaskInfo>, EngineError> {
        let mut tasks = Vec::new();
        for service in self.list_services(label).await? {
            let records = self.cli.service_tasks(&service.id).await.map_err(cli_error)?;
            tasks.extend(records.into_iter().map(|record| TaskInfo {
                state: record.state(),
                desired_state: record.desired(),
                id: record.id,
                service_id: Some(service.id.clone()),
                container_id: None,
            }));
        }
        Ok(tasks)
    }
}
