//! Data containers, service containers and client containers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{
    ContainerCreate, ContainerInfo, EngineError, ImageMetadata, SharedEngine, TRACKING_LABEL,
    tracking_labels,
};
use crate::error::{FixtureError, Result};
use crate::naming::{desired_or_random, random_name};
use crate::provision::{
    NetworkDescriptor, Reclaim, ResourceHandle, ResourceKind, VolumeSet, startup_grace,
    wait_for_start,
};

/// Everything a service container is built from.
#[derive(Debug, Clone, Copy)]
pub struct ContainerSpec<'a> {
    pub image: &'a ImageMetadata,
    /// Container name; empty for one generated from `service_name`.
    pub name: &'a str,
    pub service_name: &'a str,
    pub network: &'a NetworkDescriptor,
    pub volumes: &'a VolumeSet,
    pub environment: &'a BTreeMap<String, String>,
}

/// Runs and removes detached containers.
#[derive(Clone)]
pub struct ContainerProvisioner {
    engine: SharedEngine,
    default_start_period: Duration,
}

impl ContainerProvisioner {
    pub fn new(engine: SharedEngine, default_start_period: Duration) -> Self {
        Self {
            engine,
            default_start_period,
        }
    }

    /// Run a short-lived container whose volumes others can share.
    ///
    /// An empty `name` gets a generated one.
    pub async fn run_data_container(
        &self,
        image: &ImageMetadata,
        service_name: &str,
        name: &str,
    ) -> Result<ResourceHandle> {
        let request = ContainerCreate {
            name: desired_or_random(name, Some(&format!("{service_name}_data"))),
            image: image.primary_tag().to_string(),
            command: Some(vec!["sleep".to_string(), "30".to_string()]),
            labels: tracking_labels(),
            ..Default::default()
        };
        tracing::info!(
            "docker container run -d --name {} --label {} {} sleep 30",
            request.name,
            TRACKING_LABEL,
            request.image
        );
        let handle = self.run(ResourceKind::DataContainer, &request).await?;
        tracing::info!("data container id = {}", handle.short_id());
        Ok(handle)
    }

    /// Run the container under test and wait out its startup grace period.
    pub async fn run_container(&self, spec: &ContainerSpec<'_>) -> Result<ResourceHandle> {
        let request = container_create(desired_or_random(spec.name, Some(spec.service_name)), spec);
        tracing::info!(
            "docker container run -d --name {} --label {}{}{} {} {} {}",
            request.name,
            TRACKING_LABEL,
            request
                .network_mode
                .as_deref()
                .map(|n| format!(" --network {n}"))
                .unwrap_or_default(),
            request
                .hostname
                .as_deref()
                .map(|h| format!(" --hostname {h}"))
                .unwrap_or_default(),
            request.binds.join(" "),
            request.env.join(" "),
            request.image
        );
        let handle = self.run(ResourceKind::Container, &request).await?;
        tracing::info!("container id = {}", handle.short_id());

        wait_for_start(startup_grace(spec.image, self.default_start_period)).await;
        Ok(handle)
    }

    /// Run a `top` container on the same network as `target`, able to reach
    /// it by name.
    ///
    /// Uses `image` when given, otherwise the target's own image.
    pub async fn run_client_container(
        &self,
        target: &ResourceHandle,
        image: Option<&ImageMetadata>,
    ) -> Result<ResourceHandle> {
        let client_kind = ResourceKind::ClientContainer;
        let info = self
            .engine
            .inspect_container(&target.id)
            .await
            .map_err(|e| FixtureError::provision(client_kind, &target.name, e))?;
        let network = self
            .network_of(&info)
            .await
            .map_err(|e| FixtureError::provision(client_kind, &target.name, e))?;
        let image = match (image, &info.image) {
            (Some(image), _) => image.primary_tag().to_string(),
            (None, Some(image)) => image.clone(),
            (None, None) => {
                return Err(FixtureError::provision(
                    client_kind,
                    &target.name,
                    "target container reports no image",
                ));
            }
        };

        let name = random_name(Some(&format!("{}_client", info.name)));
        let request = client_container_create(name, &info.name, &network, image);
        tracing::info!(
            "docker container run -d --name {} --label {}{}{}{} {} top",
            request.name,
            TRACKING_LABEL,
            request
                .links
                .first()
                .map(|l| format!(" --link {l}"))
                .unwrap_or_default(),
            request
                .network_mode
                .as_deref()
                .map(|n| format!(" --network {n}"))
                .unwrap_or_default(),
            request
                .extra_hosts
                .first()
                .map(|h| format!(" --add-host {h}"))
                .unwrap_or_default(),
            request.image
        );
        let handle = self.run(client_kind, &request).await?;
        tracing::info!("client container id = {}", handle.short_id());
        Ok(handle)
    }

    /// Current status of a container, e.g. `running`.
    pub async fn status(&self, id: &str) -> Result<Option<String>> {
        Ok(self.engine.inspect_container(id).await?.status)
    }

    async fn run(&self, kind: ResourceKind, request: &ContainerCreate) -> Result<ResourceHandle> {
        let id = self
            .engine
            .run_container(request)
            .await
            .map_err(|e| FixtureError::provision(kind, &request.name, e))?;
        let handle = ResourceHandle::owned(kind, id, request.name.clone());
        // The container exists now; a failed status read must not lose it.
        let status = match self.status(&handle.id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!("Could not read status of {}: {}", handle.name, e);
                None
            }
        };
        Ok(handle.with_status(status))
    }

    /// Name of the network `info` is attached through.
    async fn network_of(&self, info: &ContainerInfo) -> std::result::Result<String, EngineError> {
        let mode = info.network_mode.as_deref().unwrap_or("default");
        let network_id = info
            .networks
            .get(mode)
            .or_else(|| {
                // `default` is reported under the bridge's real name.
                (info.networks.len() == 1)
                    .then(|| info.networks.values().next())
                    .flatten()
            })
            .ok_or_else(|| EngineError::NotFound {
                what: format!("network '{mode}' of container {}", info.name),
            })?;
        Ok(self.engine.inspect_network(network_id).await?.name)
    }
}

/// Request for the container under test.
///
/// The default bridge is joined implicitly; on the host network the
/// hostname is pinned to `localhost`.
pub fn container_create(name: String, spec: &ContainerSpec<'_>) -> ContainerCreate {
    let network = spec.network;
    ContainerCreate {
        name,
        image: spec.image.primary_tag().to_string(),
        command: None,
        hostname: network.is_host().then(|| "localhost".to_string()),
        network_mode: (!network.is_default_bridge()).then(|| network.name().to_string()),
        binds: spec.volumes.bind_specs(),
        volumes_from: spec.volumes.volumes_from(),
        links: Vec::new(),
        extra_hosts: Vec::new(),
        env: spec
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect(),
        labels: tracking_labels(),
    }
}

/// Request for a client of container `target_name` on `network`.
///
/// On the default bridge the target is reached through a link; on the host
/// network its name resolves to the loopback address.
pub fn client_container_create(
    name: String,
    target_name: &str,
    network: &str,
    image: String,
) -> ContainerCreate {
    let on_bridge = network == "bridge";
    ContainerCreate {
        name,
        image,
        command: Some(vec!["top".to_string()]),
        network_mode: (!on_bridge).then(|| network.to_string()),
        links: if on_bridge {
            vec![format!("{target_name}:{target_name}")]
        } else {
            Vec::new()
        },
        extra_hosts: if network == "host" {
            vec![format!("{target_name}:127.0.0.1")]
        } else {
            Vec::new()
        },
        labels: tracking_labels(),
        ..Default::default()
    }
}

#[async_trait]
impl Reclaim for ContainerProvisioner {
    async fn exists(&self, handle: &ResourceHandle) -> Result<bool> {
        Ok(self.engine.container_exists(&handle.id).await?)
    }

    async fn remove(&self, handle: &ResourceHandle) -> Result<()> {
        tracing::info!("docker container rm --volumes --force {}", handle.name);
        match self.engine.remove_container(&handle.id, true, true).await {
            Ok(()) | Err(EngineError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::provision::{NetworkDriver, VolumeBinding, VolumeKind};
    use crate::testing::FakeEngine;

    fn network(driver: NetworkDriver, name: &str) -> NetworkDescriptor {
        let handle = if driver.is_builtin() {
            ResourceHandle::borrowed(ResourceKind::Network, format!("id-{name}"), name)
        } else {
            ResourceHandle::owned(ResourceKind::Network, format!("id-{name}"), name)
        };
        NetworkDescriptor {
            handle,
            driver,
            attachable: !driver.is_builtin(),
        }
    }

    fn volumes(kind: VolumeKind, source: &str) -> VolumeSet {
        VolumeSet {
            kind,
            bindings: vec![VolumeBinding {
                kind,
                source: source.to_string(),
                target: "/data".to_string(),
            }],
            handles: Vec::new(),
            data_container: None,
            bind_dir: None,
        }
    }

    fn image() -> ImageMetadata {
        FakeEngine::python_hello()
    }

    #[test]
    fn test_container_on_default_bridge_omits_network() {
        let image = image();
        let net = network(NetworkDriver::Default, "bridge");
        let vols = volumes(VolumeKind::Named, "pytest_python-hello_data_01");
        let env = BTreeMap::from([("HELLO".to_string(), "world".to_string())]);
        let spec = ContainerSpec {
            image: &image,
            name: "",
            service_name: "python-hello",
            network: &net,
            volumes: &vols,
            environment: &env,
        };

        let request = container_create("pytest_python-hello_01".to_string(), &spec);
        assert_eq!(request.network_mode, None);
        assert_eq!(request.hostname, None);
        assert_eq!(request.binds, vec!["pytest_python-hello_data_01:/data".to_string()]);
        assert_eq!(request.env, vec!["HELLO=world".to_string()]);
        assert_eq!(request.image, "google/python-hello:latest");
        assert!(request.labels.contains_key(TRACKING_LABEL));
    }

    #[test]
    fn test_container_on_host_network_pins_hostname() {
        let image = image();
        let net = network(NetworkDriver::Host, "host");
        let vols = volumes(VolumeKind::Container, "ctr-data");
        let env = BTreeMap::new();
        let spec = ContainerSpec {
            image: &image,
            name: "",
            service_name: "python-hello",
            network: &net,
            volumes: &vols,
            environment: &env,
        };

        let request = container_create("c".to_string(), &spec);
        assert_eq!(request.network_mode.as_deref(), Some("host"));
        assert_eq!(request.hostname.as_deref(), Some("localhost"));
        assert!(request.binds.is_empty());
        assert_eq!(request.volumes_from, vec!["ctr-data".to_string()]);
    }

    #[test]
    fn test_client_on_bridge_links_target() {
        let request = client_container_create(
            "client".to_string(),
            "svc",
            "bridge",
            "busybox:latest".to_string(),
        );
        assert_eq!(request.links, vec!["svc:svc".to_string()]);
        assert_eq!(request.network_mode, None);
        assert!(request.extra_hosts.is_empty());
        assert_eq!(request.command, Some(vec!["top".to_string()]));
    }

    #[test]
    fn test_client_on_host_maps_loopback() {
        let request =
            client_container_create("client".to_string(), "svc", "host", "img".to_string());
        assert_eq!(request.extra_hosts, vec!["svc:127.0.0.1".to_string()]);
        assert_eq!(request.network_mode.as_deref(), Some("host"));
        assert!(request.links.is_empty());
    }

    #[test]
    fn test_client_on_user_network_needs_nothing_extra() {
        let request =
            client_container_create("client".to_string(), "svc", "pytest_net", "img".to_string());
        assert_eq!(request.network_mode.as_deref(), Some("pytest_net"));
        assert!(request.links.is_empty());
        assert!(request.extra_hosts.is_empty());
    }

    #[tokio::test]
    async fn test_data_container_runs_sleep() {
        let engine = Arc::new(FakeEngine::new().with_image(image()));
        let containers = ContainerProvisioner::new(engine.clone(), Duration::from_secs(1));
        let handle = containers
            .run_data_container(&image(), "python-hello", "")
            .await
            .unwrap();

        assert_eq!(handle.kind, ResourceKind::DataContainer);
        assert!(handle.name.starts_with("pytest_python-hello_data_"));
        assert_eq!(handle.status.as_deref(), Some("running"));
        let created = engine.created_container(&handle.id).unwrap();
        assert_eq!(
            created.command,
            Some(vec!["sleep".to_string(), "30".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_container_waits_for_health_start_period() {
        let image = ImageMetadata {
            health_start_period_ns: Some(3_000_000_000),
            ..image()
        };
        let engine = Arc::new(FakeEngine::new().with_image(image.clone()));
        let containers = ContainerProvisioner::new(engine.clone(), Duration::from_secs(1));
        let net = network(NetworkDriver::Default, "bridge");
        let vols = volumes(VolumeKind::Anonymous, "");
        let env = BTreeMap::new();

        let started = tokio::time::Instant::now();
        let handle = containers
            .run_container(&ContainerSpec {
                image: &image,
                name: "",
                service_name: "python-hello",
                network: &net,
                volumes: &vols,
                environment: &env,
            })
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(handle.kind, ResourceKind::Container);
        assert!(handle.name.starts_with("pytest_python-hello_"));
    }

    #[tokio::test]
    async fn test_desired_container_names() {
        let engine = Arc::new(FakeEngine::new().with_image(image()));
        let containers = ContainerProvisioner::new(engine.clone(), Duration::ZERO);
        let net = network(NetworkDriver::Default, "bridge");
        let vols = volumes(VolumeKind::Anonymous, "");
        let env = BTreeMap::new();
        let image = image();

        let data = containers
            .run_data_container(&image, "python-hello", "hello_data")
            .await
            .unwrap();
        assert_eq!(data.name, "hello_data");

        let handle = containers
            .run_container(&ContainerSpec {
                image: &image,
                name: "hello",
                service_name: "python-hello",
                network: &net,
                volumes: &vols,
                environment: &env,
            })
            .await
            .unwrap();
        assert_eq!(handle.name, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_container_follows_target_network() {
        let engine = Arc::new(FakeEngine::new().with_image(image()));
        let containers = ContainerProvisioner::new(engine.clone(), Duration::from_secs(1));
        let net = network(NetworkDriver::Default, "bridge");
        let vols = volumes(VolumeKind::Anonymous, "");
        let env = BTreeMap::new();
        let image = image();
        let target = containers
            .run_container(&ContainerSpec {
                image: &image,
                name: "",
                service_name: "python-hello",
                network: &net,
                volumes: &vols,
                environment: &env,
            })
            .await
            .unwrap();

        let client = containers.run_client_container(&target, None).await.unwrap();
        assert!(client.name.starts_with(&format!("pytest_{}_client_", target.name)));
        let created = engine.created_container(&client.id).unwrap();
        assert_eq!(created.links, vec![format!("{0}:{0}", target.name)]);
        assert_eq!(created.image, "google/python-hello:latest");
    }

    #[tokio::test]
    async fn test_remove_tolerates_absent_container() {
        let engine = Arc::new(FakeEngine::new());
        let containers = ContainerProvisioner::new(engine.clone(), Duration::from_secs(1));
        let handle = ResourceHandle::owned(ResourceKind::Container, "gone", "gone");
        assert!(!containers.exists(&handle).await.unwrap());
        containers.remove(&handle).await.unwrap();
    }
}
