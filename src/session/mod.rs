//! Scoped sessions that provision resources and tear them down again.
//!
//! A [`Session`] records every resource it creates in its [`Registry`] and,
//! on [`Session::teardown_all`], removes them newest first. Teardown checks
//! that each resource still exists before removing it, skips resources the
//! session merely borrowed, and keeps going past individual failures.

pub mod registry;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::bridge::CliClient;
use crate::client::DockerClient;
use crate::config::Settings;
use crate::engine::{ImageMetadata, SharedEngine};
use crate::error::{FixtureError, Result};
use crate::naming::desired_or_random;
use crate::provision::container::ContainerSpec;
use crate::provision::{
    ContainerProvisioner, NetworkDescriptor, NetworkDriver, NetworkProvisioner, Reclaim,
    ResourceHandle, ResourceKind, ServiceProvisioner, SwarmProvisioner, VolumeKind,
    VolumeProvisioner, VolumeRequest, VolumeSet, resolve_image,
};
use crate::stack::{Stack, StackReclaimer};

pub use registry::{Registry, RegistryEntry};

/// Lifetime a session's resources are shared over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Test,
    Class,
    Module,
    Session,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Test => "test",
            Scope::Class => "class",
            Scope::Module => "module",
            Scope::Session => "session",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved settings plus the temporary directory bind volumes live under.
///
/// Cheap to clone; the directory is deleted when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct SessionContext {
    settings: Arc<Settings>,
    tmp_root: Arc<TempDir>,
}

impl SessionContext {
    pub fn new(settings: Settings) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("container-fixtures-");
        let tmp_root = match &settings.tmp_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        tracing::debug!("session temp root: {}", tmp_root.path().display());
        Ok(Self {
            settings: Arc::new(settings),
            tmp_root: Arc::new(tmp_root),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tmp_root(&self) -> &Path {
        self.tmp_root.path()
    }
}

/// A network of some driver, optionally with a chosen name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRequest {
    pub driver: NetworkDriver,
    /// Empty for a generated name; ignored by built-in drivers.
    pub name: String,
}

impl NetworkRequest {
    pub fn new(driver: NetworkDriver) -> Self {
        Self {
            driver,
            name: String::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl From<NetworkDriver> for NetworkRequest {
    fn from(driver: NetworkDriver) -> Self {
        Self::new(driver)
    }
}

/// A container to run, with the network and volumes it needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRequest {
    pub image: ImageMetadata,
    /// Empty for a generated name.
    pub name: String,
    pub network: NetworkRequest,
    pub volumes: VolumeRequest,
    pub environment: BTreeMap<String, String>,
}

impl ContainerRequest {
    /// Default bridge, anonymous volumes, empty environment.
    pub fn new(image: ImageMetadata) -> Self {
        Self {
            image,
            name: String::new(),
            network: NetworkDriver::Default.into(),
            volumes: VolumeKind::Anonymous.into(),
            environment: BTreeMap::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn network(mut self, network: impl Into<NetworkRequest>) -> Self {
        self.network = network.into();
        self
    }

    pub fn volumes(mut self, volumes: impl Into<VolumeRequest>) -> Self {
        self.volumes = volumes.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// A replicated swarm service to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub image: ImageMetadata,
    /// Empty for a generated name.
    pub name: String,
    pub network: NetworkRequest,
    pub replicas: u64,
    pub environment: BTreeMap<String, String>,
}

impl ServiceRequest {
    /// One replica on a fresh overlay network.
    pub fn new(image: ImageMetadata) -> Self {
        Self {
            image,
            name: String::new(),
            network: NetworkDriver::Overlay.into(),
            replicas: crate::config::matrix::SERVICE_REPLICAS[0],
            environment: BTreeMap::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn network(mut self, network: impl Into<NetworkRequest>) -> Self {
        self.network = network.into();
        self
    }

    pub fn replicas(mut self, replicas: u64) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

/// Anything a session can create through [`Session::create`].
///
/// Every kind carries a desired name; an empty one gets a generated name.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Network(NetworkRequest),
    /// Volumes for every mount point of the service image plus the
    /// request's own targets.
    Volume(VolumeRequest),
    Container(ContainerRequest),
    Service(ServiceRequest),
    /// An empty name gets a generated one.
    Stack {
        name: String,
        compose_file: Option<String>,
    },
}

/// A running container and what it was built on.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerFixture {
    pub network: NetworkDescriptor,
    pub volumes: VolumeSet,
    pub container: ResourceHandle,
}

/// A running service and what it was built on.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFixture {
    pub swarm: ResourceHandle,
    pub network: NetworkDescriptor,
    pub service: ResourceHandle,
}

/// Result of [`Session::create`].
#[derive(Debug, Clone)]
pub enum Resource {
    Network(NetworkDescriptor),
    Volumes(VolumeSet),
    Container(ContainerFixture),
    Service(ServiceFixture),
    Stack(Stack),
}

/// What one teardown pass did.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub removed: Vec<ResourceHandle>,
    /// Owned resources that had disappeared before teardown reached them.
    pub already_gone: Vec<ResourceHandle>,
    /// Borrowed resources, left in place.
    pub skipped: Vec<ResourceHandle>,
    /// One [`FixtureError::Teardown`] per resource that could not be removed.
    pub failures: Vec<FixtureError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// The report, or an error describing the failures.
    ///
    /// Several failures are folded into the first one's message.
    pub fn into_result(mut self) -> Result<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        let more = self.failures.len() - 1;
        let first = self.failures.remove(0);
        Err(match first {
            FixtureError::Teardown { kind, id, reason } if more > 0 => FixtureError::Teardown {
                kind,
                id,
                reason: format!("{reason} (and {more} more teardown failures)"),
            },
            other => other,
        })
    }
}

/// Provisions resources for one scope and removes them at its end.
///
/// Operations take `&mut self` and run one at a time.
pub struct Session {
    scope: Scope,
    client: DockerClient,
    context: SessionContext,
    test_name: String,
    registry: Registry,
    networks: NetworkProvisioner,
    volumes: VolumeProvisioner,
    containers: ContainerProvisioner,
    swarms: SwarmProvisioner,
    services: ServiceProvisioner,
    stacks: StackReclaimer,
    teardown_on_drop: bool,
}

impl Session {
    /// Session over `engine`, with the CLI configured from the context.
    pub fn new(scope: Scope, engine: SharedEngine, context: SessionContext) -> Self {
        let cli = CliClient::from_settings(context.settings());
        Self::with_client(scope, DockerClient::new(engine, cli), context)
    }

    pub fn with_client(scope: Scope, client: DockerClient, context: SessionContext) -> Self {
        let settings = context.settings();
        let engine = client.engine().clone();
        Self {
            scope,
            networks: NetworkProvisioner::new(engine.clone(), settings.network_settle),
            volumes: VolumeProvisioner::new(
                engine.clone(),
                settings.service_name.clone(),
                context.tmp_root().to_path_buf(),
            ),
            containers: ContainerProvisioner::new(engine.clone(), settings.default_start_period),
            swarms: SwarmProvisioner::new(engine.clone()),
            services: ServiceProvisioner::new(engine, settings.default_start_period),
            stacks: StackReclaimer::new(client.cli().clone()),
            test_name: scope.as_str().to_string(),
            registry: Registry::new(),
            teardown_on_drop: true,
            client,
            context,
        }
    }

    /// Name bind-volume directories after `name` instead of the scope.
    pub fn with_test_name(mut self, name: impl Into<String>) -> Self {
        self.test_name = name.into();
        self
    }

    /// Independent session for a nested scope, sharing engine and context.
    ///
    /// Tear the child down before its parent.
    pub fn child(&self, scope: Scope) -> Session {
        Session::with_client(scope, self.client.clone(), self.context.clone())
            .with_test_name(self.test_name.clone())
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn client(&self) -> &DockerClient {
        &self.client
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn settings(&self) -> &Settings {
        self.context.settings()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// The image under test, pulled if the engine does not have it yet.
    pub async fn image(&self) -> Result<ImageMetadata> {
        let reference = self.settings().image_reference();
        resolve_image(self.client.engine().as_ref(), &reference).await
    }

    /// Create whatever `spec` describes.
    pub async fn create(&mut self, spec: ResourceSpec) -> Result<Resource> {
        match spec {
            ResourceSpec::Network(request) => self.network(request).await.map(Resource::Network),
            ResourceSpec::Volume(request) => {
                let image = self.image().await?;
                self.volumes(request, &image).await.map(Resource::Volumes)
            }
            ResourceSpec::Container(request) => self
                .provision_container(&request)
                .await
                .map(Resource::Container),
            ResourceSpec::Service(request) => self.service(&request).await.map(Resource::Service),
            ResourceSpec::Stack { name, compose_file } => self
                .deploy_stack(&name, compose_file.as_deref())
                .await
                .map(Resource::Stack),
        }
    }

    /// A network of the requested driver; an overlay brings up a swarm
    /// first.
    pub async fn network(
        &mut self,
        request: impl Into<NetworkRequest>,
    ) -> Result<NetworkDescriptor> {
        let request = request.into();
        if request.driver.requires_swarm() {
            self.swarm().await?;
        }
        let service_name = self.settings().service_name.clone();
        let network = self
            .networks
            .create_named(request.driver, &request.name, &service_name)
            .await?;
        tracing::info!("network id = {}", network.handle.short_id());
        self.registry.record(network.handle.clone());
        Ok(network)
    }

    /// Storage for every volume `image` declares and every extra target of
    /// the request.
    ///
    /// [`VolumeKind::Container`] runs a data container first, named after
    /// the request.
    pub async fn volumes(
        &mut self,
        request: impl Into<VolumeRequest>,
        image: &ImageMetadata,
    ) -> Result<VolumeSet> {
        let request = request.into();
        let data_container = match request.kind {
            VolumeKind::Container => Some(self.named_data_container(image, &request.name).await?),
            _ => None,
        };
        let set = self
            .volumes
            .create(&request, image, &self.test_name, data_container.as_ref())
            .await?;
        for handle in &set.handles {
            self.registry.record(handle.clone());
        }
        Ok(set)
    }

    pub async fn data_container(&mut self, image: &ImageMetadata) -> Result<ResourceHandle> {
        self.named_data_container(image, "").await
    }

    /// [`data_container`](Self::data_container) called `name`, or a
    /// generated name when it is empty.
    pub async fn named_data_container(
        &mut self,
        image: &ImageMetadata,
        name: &str,
    ) -> Result<ResourceHandle> {
        let service_name = self.settings().service_name.clone();
        let handle = self
            .containers
            .run_data_container(image, &service_name, name)
            .await?;
        self.registry.record(handle.clone());
        Ok(handle)
    }

    /// Run the container under test on resources provisioned earlier.
    ///
    /// An empty `name` gets a generated one.
    pub async fn container(
        &mut self,
        name: &str,
        image: &ImageMetadata,
        network: &NetworkDescriptor,
        volumes: &VolumeSet,
        environment: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle> {
        let service_name = self.settings().service_name.clone();
        let spec = ContainerSpec {
            image,
            name,
            service_name: &service_name,
            network,
            volumes,
            environment,
        };
        let handle = self.containers.run_container(&spec).await?;
        self.registry.record(handle.clone());
        Ok(handle)
    }

    /// A client container that can reach `target` by name.
    pub async fn client_container(
        &mut self,
        target: &ResourceHandle,
        image: Option<&ImageMetadata>,
    ) -> Result<ResourceHandle> {
        let handle = self.containers.run_client_container(target, image).await?;
        self.registry.record(handle.clone());
        Ok(handle)
    }

    /// The swarm, initialized on first use.
    pub async fn swarm(&mut self) -> Result<ResourceHandle> {
        if let Some(handle) = self.registry.live_of_kind(ResourceKind::Swarm) {
            return Ok(handle.clone());
        }
        let handle = self.swarms.init().await?;
        self.registry.record(handle.clone());
        Ok(handle)
    }

    /// Swarm, network and service, in that order.
    pub async fn service(&mut self, request: &ServiceRequest) -> Result<ServiceFixture> {
        let swarm = self.swarm().await?;
        let network = self.network(request.network.clone()).await?;
        let service_name = self.settings().service_name.clone();
        let service = self
            .services
            .create(
                &request.image,
                &request.name,
                &service_name,
                &network,
                request.replicas,
                &request.environment,
            )
            .await?;
        self.registry.record(service.clone());
        Ok(ServiceFixture {
            swarm,
            network,
            service,
        })
    }

    /// Deploy a stack on the swarm; an empty `name` gets a generated one.
    pub async fn deploy_stack(&mut self, name: &str, compose_file: Option<&str>) -> Result<Stack> {
        self.swarm().await?;
        let name = desired_or_random(name, None);
        let stack = self.client.stacks().deploy(&name, compose_file).await?;
        self.registry.record(stack.handle());
        Ok(stack)
    }

    /// Network, volumes and container for `request`, in that order.
    pub async fn provision_container(
        &mut self,
        request: &ContainerRequest,
    ) -> Result<ContainerFixture> {
        let network = self.network(request.network.clone()).await?;
        let volumes = self.volumes(request.volumes.clone(), &request.image).await?;
        let container = self
            .container(
                &request.name,
                &request.image,
                &network,
                &volumes,
                &request.environment,
            )
            .await?;
        Ok(ContainerFixture {
            network,
            volumes,
            container,
        })
    }

    /// Re-read the status of `handle` from the engine.
    ///
    /// Containers report their engine status; other kinds report `present`
    /// or `absent`.
    pub async fn refresh(&mut self, handle: &ResourceHandle) -> Result<ResourceHandle> {
        let status = if !self.reclaimer(handle.kind).exists(handle).await? {
            Some("absent".to_string())
        } else if handle.kind.is_container() {
            self.containers.status(&handle.id).await?
        } else {
            Some("present".to_string())
        };
        let refreshed = handle.clone().with_status(status);
        self.registry.update(&refreshed);
        Ok(refreshed)
    }

    /// Remove every live resource, newest first.
    ///
    /// Safe to call repeatedly; released entries are never revisited.
    pub async fn teardown_all(&mut self) -> TeardownReport {
        let positions = self.registry.live_positions_newest_first();
        let mut report = TeardownReport::default();
        if positions.is_empty() {
            return report;
        }
        tracing::info!(scope = %self.scope, "teardown of {} resources", positions.len());

        for position in positions {
            let Some(handle) = self.registry.handle(position).cloned() else {
                continue;
            };

            if !handle.is_owned() {
                tracing::info!("no need to remove borrowed {} {}", handle.kind, handle.name);
                self.registry.release(position);
                report.skipped.push(handle);
                continue;
            }

            match self.reclaim(&handle).await {
                Ok(true) => {
                    self.registry.release(position);
                    report.removed.push(handle);
                }
                Ok(false) => {
                    tracing::info!("{} {} already removed", handle.kind, handle.name);
                    self.registry.release(position);
                    report.already_gone.push(handle);
                }
                Err(e) => {
                    tracing::warn!(
                        kind = %handle.kind,
                        id = %handle.id,
                        "Failed to remove {}: {}",
                        handle.name,
                        e
                    );
                    report.failures.push(FixtureError::Teardown {
                        kind: handle.kind,
                        id: handle.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Run `f` with this session, then tear everything down.
    ///
    /// An error from `f` wins over teardown failures, which are logged.
    pub async fn scoped<T, F>(mut self, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Session) -> Result<T>,
    {
        let outcome = f(&mut self).await;
        let report = self.teardown_all().await;
        self.teardown_on_drop = false;
        match outcome {
            Ok(value) => report.into_result().map(|_| value),
            Err(e) => {
                if !report.is_clean() {
                    tracing::warn!(
                        "{} teardown failures after a failed {} scope",
                        report.failures.len(),
                        self.scope
                    );
                }
                Err(e)
            }
        }
    }

    /// Remove `handle` if it still exists; `false` when it was already gone.
    async fn reclaim(&self, handle: &ResourceHandle) -> Result<bool> {
        let reclaimer = self.reclaimer(handle.kind);
        if !reclaimer.exists(handle).await? {
            return Ok(false);
        }
        reclaimer.remove(handle).await?;
        Ok(true)
    }

    fn reclaimer(&self, kind: ResourceKind) -> &dyn Reclaim {
        match kind {
            ResourceKind::Network => &self.networks,
            ResourceKind::Volume => &self.volumes,
            ResourceKind::DataContainer | ResourceKind::Container | ResourceKind::ClientContainer => {
                &self.containers
            }
            ResourceKind::Swarm => &self.swarms,
            ResourceKind::Service => &self.services,
            ResourceKind::Stack => &self.stacks,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.teardown_on_drop {
            return;
        }
        let live = self.registry.owned_live_count();
        if live == 0 {
            return;
        }
        tracing::warn!(
            scope = %self.scope,
            "Session dropped with {} live resources; use teardown_all() or Session::scoped",
            live
        );

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime to clean up on; {} resources leak", live);
            return;
        };
        let mut orphan = self.child(self.scope);
        orphan.registry = std::mem::take(&mut self.registry);
        orphan.teardown_on_drop = false;
        runtime.spawn(async move {
            let report = orphan.teardown_all().await;
            if !report.is_clean() {
                tracing::warn!(
                    "Background teardown left {} resources behind",
                    report.failures.len()
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::FakeEngine;

    fn context() -> SessionContext {
        let settings = Settings {
            network_settle: Duration::ZERO,
            default_start_period: Duration::ZERO,
            ..Default::default()
        };
        SessionContext::new(settings).unwrap()
    }

    fn session(engine: &Arc<FakeEngine>) -> Session {
        Session::new(Scope::Class, engine.clone(), context())
    }

    #[test]
    fn test_into_result_folds_failures() {
        let report = TeardownReport {
            failures: vec![
                FixtureError::Teardown {
                    kind: ResourceKind::Network,
                    id: "n1".to_string(),
                    reason: "in use".to_string(),
                },
                FixtureError::Teardown {
                    kind: ResourceKind::Volume,
                    id: "v1".to_string(),
                    reason: "busy".to_string(),
                },
            ],
            ..Default::default()
        };
        let err = report.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to remove network 'n1': in use (and 1 more teardown failures)"
        );
        assert!(TeardownReport::default().into_result().is_ok());
    }

    #[test]
    fn test_container_request_defaults() {
        let request = ContainerRequest::new(FakeEngine::python_hello()).env("FOO", "2018");
        assert_eq!(request.network.driver, NetworkDriver::Default);
        assert_eq!(request.volumes.kind, VolumeKind::Anonymous);
        assert!(request.name.is_empty());
        assert_eq!(request.environment.get("FOO").map(String::as_str), Some("2018"));

        let request = ServiceRequest::new(FakeEngine::python_hello());
        assert_eq!(request.network.driver, NetworkDriver::Overlay);
        assert_eq!(request.replicas, 1);
    }

    #[tokio::test]
    async fn test_context_tmp_root_lives_with_clones() {
        let ctx = context();
        let path = ctx.tmp_root().to_path_buf();
        let clone = ctx.clone();
        drop(ctx);
        assert!(path.is_dir());
        drop(clone);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_swarm_is_initialized_once() {
        let engine = Arc::new(FakeEngine::new());
        let mut session = session(&engine);

        let first = session.swarm().await.unwrap();
        let second = session.swarm().await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(engine.calls_starting_with("init_swarm").len(), 1);

        session.teardown_all().await.into_result().unwrap();
        assert_eq!(engine.calls_starting_with("leave_swarm").len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_reports_absent_container() {
        let engine = Arc::new(FakeEngine::new().with_image(FakeEngine::python_hello()));
        let mut session = session(&engine);
        let image = session.image().await.unwrap();
        let data = session.data_container(&image).await.unwrap();

        let refreshed = session.refresh(&data).await.unwrap();
        assert_eq!(refreshed.status.as_deref(), Some("running"));

        engine.forget_container(&data.id);
        let refreshed = session.refresh(&data).await.unwrap();
        assert_eq!(refreshed.status.as_deref(), Some("absent"));
        assert_eq!(
            session.registry().entries()[0].handle.status.as_deref(),
            Some("absent")
        );

        session.teardown_all().await.into_result().unwrap();
    }

    #[tokio::test]
    async fn test_child_session_is_independent() {
        let engine = Arc::new(FakeEngine::new().with_image(FakeEngine::python_hello()));
        let mut parent = session(&engine);
        let mut child = parent.child(Scope::Test);
        let image = parent.image().await.unwrap();

        parent.data_container(&image).await.unwrap();
        child.data_container(&image).await.unwrap();
        assert_eq!(parent.registry().len(), 1);
        assert_eq!(child.registry().len(), 1);
        assert_eq!(child.context().tmp_root(), parent.context().tmp_root());

        child.teardown_all().await.into_result().unwrap();
        assert_eq!(engine.container_count(), 1);
        parent.teardown_all().await.into_result().unwrap();
        assert_eq!(engine.container_count(), 0);
    }
}
