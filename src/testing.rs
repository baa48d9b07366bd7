//! In-memory engine for exercising provisioners and sessions without Docker.
//!
//! [`FakeEngine`] keeps images, networks, volumes, containers, swarm state
//! and services in memory, records every mutating call, and can be told to
//! fail specific operations.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use container_fixtures::testing::FakeEngine;
//!
//! let engine = Arc::new(FakeEngine::new().with_image(FakeEngine::python_hello()));
//! // hand `engine.clone()` to a Session, then inspect `engine.calls()`
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::engine::{
    ContainerCreate, ContainerInfo, Engine, EngineError, ImageMetadata, NetworkCreate,
    NetworkInfo, ServiceCreate, ServiceInfo, TaskInfo, VolumeCreate,
};

/// Networks every engine starts with.
const BUILTIN_NETWORKS: [(&str, &str); 3] = [("bridge", "bridge"), ("host", "host"), ("none", "null")];

#[derive(Default)]
struct State {
    images: Vec<ImageMetadata>,
    registry: Vec<ImageMetadata>,
    networks: BTreeMap<String, NetworkInfo>,
    volumes: BTreeSet<String>,
    containers: BTreeMap<String, (ContainerCreate, ContainerInfo)>,
    swarm: Option<String>,
    services: BTreeMap<String, ServiceCreate>,
    calls: Vec<String>,
    /// Operation → successes left before it starts failing.
    failures: HashMap<String, usize>,
    failing_removals: BTreeSet<String>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn record(&mut self, call: String) {
        self.calls.push(call);
    }

    fn check(&mut self, op: &str) -> Result<(), EngineError> {
        match self.failures.get_mut(op) {
            Some(0) => Err(EngineError::Api {
                status: 500,
                message: format!("injected {op} failure"),
            }),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn find_image(&self, reference: &str) -> Option<ImageMetadata> {
        find_image(&self.images, reference)
    }

    fn network(&self, id_or_name: &str) -> Option<&NetworkInfo> {
        self.networks
            .get(id_or_name)
            .or_else(|| self.networks.values().find(|n| n.name == id_or_name))
    }

    fn container_id(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .iter()
            .find(|(_, (_, info))| info.name == id_or_name)
            .map(|(id, _)| id.clone())
    }

    fn service_id(&self, id_or_name: &str) -> Option<String> {
        if self.services.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.services
            .iter()
            .find(|(_, s)| s.name == id_or_name)
            .map(|(id, _)| id.clone())
    }
}

fn find_image(images: &[ImageMetadata], reference: &str) -> Option<ImageMetadata> {
    images
        .iter()
        .find(|i| i.id == reference || i.reference == reference || i.repo_tags.iter().any(|t| t == reference))
        .map(|i| ImageMetadata {
            reference: reference.to_string(),
            ..i.clone()
        })
}

fn not_found(what: impl Into<String>) -> EngineError {
    EngineError::NotFound { what: what.into() }
}

fn conflict(message: impl Into<String>) -> EngineError {
    EngineError::Api {
        status: 409,
        message: message.into(),
    }
}

fn label_matches(labels: &HashMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}

/// Engine double with Docker-like rules.
///
/// Built-in networks cannot be removed, networks and volumes in use by a
/// container cannot be removed, overlays and services need a swarm.
pub struct FakeEngine {
    state: Mutex<State>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    /// Engine with the built-in `bridge`, `host` and `none` networks.
    pub fn new() -> Self {
        let engine = Self::without_builtin_networks();
        {
            let mut state = engine.state();
            for (name, driver) in BUILTIN_NETWORKS {
                state.networks.insert(
                    format!("net-{name}"),
                    NetworkInfo {
                        id: format!("net-{name}"),
                        name: name.to_string(),
                        driver: driver.to_string(),
                        attachable: false,
                    },
                );
            }
        }
        engine
    }

    /// Engine with no networks at all.
    pub fn without_builtin_networks() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// The default service image: one `/data` volume, no health check.
    pub fn python_hello() -> ImageMetadata {
        ImageMetadata {
            id: "sha256:5f0e1c7a".to_string(),
            reference: "google/python-hello:latest".to_string(),
            repo_tags: vec!["google/python-hello:latest".to_string()],
            volumes: vec!["/data".to_string()],
            health_start_period_ns: None,
        }
    }

    /// Make `image` available locally.
    pub fn with_image(self, image: ImageMetadata) -> Self {
        self.state().images.push(image);
        self
    }

    /// Make `image` available to pull.
    pub fn with_registry_image(self, image: ImageMetadata) -> Self {
        self.state().registry.push(image);
        self
    }

    /// Add a user-defined bridge network called `name`.
    pub fn with_network(self, name: &str) -> Self {
        {
            let mut state = self.state();
            let id = state.next_id("net");
            state.networks.insert(
                id.clone(),
                NetworkInfo {
                    id,
                    name: name.to_string(),
                    driver: "bridge".to_string(),
                    attachable: true,
                },
            );
        }
        self
    }

    /// Start as a member of an existing swarm.
    pub fn with_swarm(self) -> Self {
        self.state().swarm = Some("node-existing".to_string());
        self
    }

    /// Add a running service, e.g. one belonging to a deployed stack.
    pub fn with_service(self, service: ServiceCreate) -> Self {
        {
            let mut state = self.state();
            let id = state.next_id("svc");
            state.services.insert(id, service);
        }
        self
    }

    /// Let `op` succeed `successes` times, then fail every later call.
    pub fn failing(self, op: &str, successes: usize) -> Self {
        self.state().failures.insert(op.to_string(), successes);
        self
    }

    /// Make removal of the object with `id` fail.
    pub fn fail_removal_of(&self, id: &str) {
        self.state().failing_removals.insert(id.to_string());
    }

    /// Every mutating call so far, as `"<op> <argument>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn has_network(&self, id: &str) -> bool {
        self.state().network(id).is_some()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state().volumes.contains(name)
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.state().container_id(id).is_some()
    }

    pub fn has_service(&self, id: &str) -> bool {
        self.state().service_id(id).is_some()
    }

    /// Networks other than the built-in ones.
    pub fn network_count(&self) -> usize {
        self.state()
            .networks
            .values()
            .filter(|n| !BUILTIN_NETWORKS.iter().any(|(name, _)| *name == n.name))
            .count()
    }

    pub fn volume_count(&self) -> usize {
        self.state().volumes.len()
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn service_count(&self) -> usize {
        self.state().services.len()
    }

    /// The request a container was created from.
    pub fn created_container(&self, id: &str) -> Option<ContainerCreate> {
        let state = self.state();
        let id = state.container_id(id)?;
        state.containers.get(&id).map(|(request, _)| request.clone())
    }

    /// The request a service was created from.
    pub fn created_service(&self, id: &str) -> Option<ServiceCreate> {
        let state = self.state();
        let id = state.service_id(id)?;
        state.services.get(&id).cloned()
    }

    /// Remove a network behind the session's back.
    pub fn forget_network(&self, id: &str) {
        self.state().networks.remove(id);
    }

    /// Remove a volume behind the session's back.
    pub fn forget_volume(&self, name: &str) {
        self.state().volumes.remove(name);
    }

    /// Remove a container behind the session's back.
    pub fn forget_container(&self, id: &str) {
        self.state().containers.remove(id);
    }

    /// Remove a service behind the session's back.
    pub fn forget_service(&self, id: &str) {
        self.state().services.remove(id);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_removal(state: &State, id: &str) -> Result<(), EngineError> {
        if state.failing_removals.contains(id) {
            return Err(EngineError::Api {
                status: 500,
                message: format!("injected failure removing {id}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageMetadata, EngineError> {
        self.state()
            .find_image(reference)
            .ok_or_else(|| not_found(format!("image {reference}")))
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record(format!("pull_image {reference}"));
        state.check("pull_image")?;
        let image = find_image(&state.registry, reference)
            .ok_or_else(|| not_found(format!("repository {reference}")))?;
        state.images.push(image);
        Ok(())
    }

    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkInfo>, EngineError> {
        Ok(self
            .state()
            .networks
            .values()
            .filter(|n| n.name.contains(name))
            .cloned()
            .collect())
    }

    async fn inspect_network(&self, id_or_name: &str) -> Result<NetworkInfo, EngineError> {
        self.state()
            .network(id_or_name)
            .cloned()
            .ok_or_else(|| not_found(format!("network {id_or_name}")))
    }

    async fn create_network(&self, request: &NetworkCreate) -> Result<NetworkInfo, EngineError> {
        let mut state = self.state();
        state.record(format!("create_network {}", request.name));
        state.check("create_network")?;
        if request.driver == "overlay" && state.swarm.is_none() {
            return Err(EngineError::Api {
                status: 503,
                message: "This node is not a swarm manager.".to_string(),
            });
        }
        if state.network(&request.name).is_some() {
            return Err(conflict(format!("network with name {} already exists", request.name)));
        }
        let id = state.next_id("net");
        let info = NetworkInfo {
            id: id.clone(),
            name: request.name.clone(),
            driver: request.driver.clone(),
            attachable: request.attachable,
        };
        state.networks.insert(id, info.clone());
        Ok(info)
    }

    async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record(format!("remove_network {id}"));
        state.check("remove_network")?;
        Self::check_removal(&state, id)?;
        let network = state
            .network(id)
            .cloned()
            .ok_or_else(|| not_found(format!("network {id}")))?;
        if BUILTIN_NETWORKS.iter().any(|(name, _)| *name == network.name) {
            return Err(EngineError::Api {
                status: 403,
                message: format!("{} is a pre-defined network and cannot be removed", network.name),
            });
        }
        let in_use = state
            .containers
            .values()
            .any(|(_, info)| info.networks.contains_key(&network.name))
            || state
                .services
                .values()
                .any(|s| s.networks.contains(&network.name));
        if in_use {
            return Err(EngineError::Api {
                status: 403,
                message: format!("network {} has active endpoints", network.name),
            });
        }
        state.networks.remove(&network.id);
        Ok(())
    }

    async fn create_volume(&self, request: &VolumeCreate) -> Result<String, EngineError> {
        let mut state = self.state();
        state.record(format!("create_volume {}", request.name));
        state.check("create_volume")?;
        state.volumes.insert(request.name.clone());
        Ok(request.name.clone())
    }

    async fn inspect_volume(&self, name: &str) -> Result<(), EngineError> {
        if self.state().volumes.contains(name) {
            Ok(())
        } else {
            Err(not_found(format!("volume {name}")))
        }
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record(format!("remove_volume {name}"));
        state.check("remove_volume")?;
        Self::check_removal(&state, name)?;
        if !state.volumes.contains(name) {
            return Err(not_found(format!("volume {name}")));
        }
        let prefix = format!("{name}:");
        let in_use = state
            .containers
            .values()
            .any(|(request, _)| request.binds.iter().any(|b| b.starts_with(&prefix)));
        if in_use {
            return Err(conflict(format!("volume {name} is in use")));
        }
        state.volumes.remove(name);
        Ok(())
    }

    async fn run_container(&self, request: &ContainerCreate) -> Result<String, EngineError> {
        let mut state = self.state();
        state.record(format!("run_container {}", request.name));
        state.check("run_container")?;
        if state.find_image(&request.image).is_none() {
            return Err(not_found(format!("image {}", request.image)));
        }
        if state.container_id(&request.name).is_some() {
            return Err(conflict(format!(
                "container name \"/{}\" is already in use",
                request.name
            )));
        }
        let networks = match &request.network_mode {
            Some(name) => {
                let network = state
                    .network(name)
                    .ok_or_else(|| not_found(format!("network {name}")))?;
                BTreeMap::from([(network.name.clone(), network.id.clone())])
            }
            None => state
                .network("bridge")
                .map(|n| BTreeMap::from([(n.name.clone(), n.id.clone())]))
                .unwrap_or_default(),
        };
        for source in &request.volumes_from {
            if state.container_id(source).is_none() {
                return Err(not_found(format!("container {source}")));
            }
        }
        for bind in &request.binds {
            // Named sources are created on demand, like the real engine does.
            if let Some((source, _)) = bind.split_once(':')
                && !source.starts_with('/')
            {
                state.volumes.insert(source.to_string());
            }
        }

        let id = state.next_id("ctr");
        let info = ContainerInfo {
            id: id.clone(),
            name: request.name.clone(),
            status: Some("running".to_string()),
            image: Some(request.image.clone()),
            network_mode: Some(
                request
                    .network_mode
                    .clone()
                    .unwrap_or_else(|| "default".to_string()),
            ),
            networks,
        };
        state.containers.insert(id.clone(), (request.clone(), info));
        Ok(id)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, EngineError> {
        let state = self.state();
        state
            .container_id(id)
            .and_then(|id| state.containers.get(&id))
            .map(|(_, info)| info.clone())
            .ok_or_else(|| not_found(format!("container {id}")))
    }

    async fn remove_container(
        &self,
        id: &str,
        _force: bool,
        _remove_volumes: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record(format!("remove_container {id}"));
        state.check("remove_container")?;
        Self::check_removal(&state, id)?;
        let id = state
            .container_id(id)
            .ok_or_else(|| not_found(format!("container {id}")))?;
        state.containers.remove(&id);
        Ok(())
    }

    async fn init_swarm(&self) -> Result<String, EngineError> {
        let mut state = self.state();
        state.record("init_swarm".to_string());
        state.check("init_swarm")?;
        if state.swarm.is_some() {
            return Err(EngineError::AlreadyInSwarm);
        }
        let node = state.next_id("node");
        state.swarm = Some(node.clone());
        Ok(node)
    }

    async fn swarm_active(&self) -> Result<bool, EngineError> {
        Ok(self.state().swarm.is_some())
    }

    async fn leave_swarm(&self, _force: bool) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record("leave_swarm".to_string());
        state.check("leave_swarm")?;
        if state.swarm.take().is_none() {
            return Err(EngineError::Api {
                status: 503,
                message: "This node is not part of a swarm".to_string(),
            });
        }
        state.services.clear();
        Ok(())
    }

    async fn create_service(&self, request: &ServiceCreate) -> Result<String, EngineError> {
        let mut state = self.state();
        state.record(format!("create_service {}", request.name));
        state.check("create_service")?;
        if state.swarm.is_none() {
            return Err(EngineError::Api {
                status: 503,
                message: "This node is not a swarm manager.".to_string(),
            });
        }
        for network in &request.networks {
            if state.network(network).is_none() {
                return Err(not_found(format!("network {network}")));
            }
        }
        if state.service_id(&request.name).is_some() {
            return Err(conflict(format!("service {} already exists", request.name)));
        }
        let id = state.next_id("svc");
        state.services.insert(id.clone(), request.clone());
        Ok(id)
    }

    async fn inspect_service(&self, id: &str) -> Result<ServiceInfo, EngineError> {
        let state = self.state();
        let found = state
            .service_id(id)
            .ok_or_else(|| not_found(format!("service {id}")))?;
        let service = &state.services[&found];
        Ok(ServiceInfo {
            id: found.clone(),
            name: service.name.clone(),
            replicas: Some(service.replicas),
            labels: service.labels.clone(),
        })
    }

    async fn remove_service(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        state.record(format!("remove_service {id}"));
        state.check("remove_service")?;
        Self::check_removal(&state, id)?;
        let id = state
            .service_id(id)
            .ok_or_else(|| not_found(format!("service {id}")))?;
        state.services.remove(&id);
        Ok(())
    }

    async fn list_services(&self, label: &str) -> Result<Vec<ServiceInfo>, EngineError> {
        Ok(self
            .state()
            .services
            .iter()
            .filter(|(_, s)| label_matches(&s.labels, label))
            .map(|(id, s)| ServiceInfo {
                id: id.clone(),
                name: s.name.clone(),
                replicas: Some(s.replicas),
                labels: s.labels.clone(),
            })
            .collect())
    }

    async fn list_tasks(&self, label: &str) -> Result<Vec<TaskInfo>, EngineError> {
        Ok(self
            .state()
            .services
            .iter()
            .filter(|(_, s)| label_matches(&s.labels, label))
            .flat_map(|(id, s)| {
                (1..=s.replicas).map(move |slot| TaskInfo {
                    id: format!("task-{id}-{slot}"),
                    service_id: Some(id.clone()),
                    state: Some("running".to_string()),
                    desired_state: Some("running".to_string()),
                    container_id: None,
                })
            })
            .collect())
    }
}
