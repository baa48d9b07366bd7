//! Replicated swarm services.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{EngineError, ImageMetadata, ServiceCreate, SharedEngine, tracking_labels};
use crate::error::{FixtureError, Result};
use crate::naming::desired_or_random;
use crate::provision::{
    NetworkDescriptor, Reclaim, ResourceHandle, ResourceKind, startup_grace, wait_for_start,
};

/// Placement constraint that keeps tasks on the local manager.
pub const MANAGER_CONSTRAINT: &str = "node.role == manager";

/// Creates services on an active swarm.
#[derive(Clone)]
pub struct ServiceProvisioner {
    engine: SharedEngine,
    default_start_period: Duration,
}

impl ServiceProvisioner {
    pub fn new(engine: SharedEngine, default_start_period: Duration) -> Self {
        Self {
            engine,
            default_start_period,
        }
    }

    /// Create `replicas` tasks of `image` on `network`, then wait out the
    /// startup grace period.
    ///
    /// An empty `name` gets one generated from `service_name`. Fails without
    /// touching the engine when the node is not a swarm manager.
    pub async fn create(
        &self,
        image: &ImageMetadata,
        name: &str,
        service_name: &str,
        network: &NetworkDescriptor,
        replicas: u64,
        environment: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle> {
        let name = desired_or_random(name, Some(service_name));
        let swarm_active = self
            .engine
            .swarm_active()
            .await
            .map_err(|e| FixtureError::provision(ResourceKind::Service, &name, e))?;
        if !swarm_active {
            return Err(FixtureError::provision(
                ResourceKind::Service,
                &name,
                "this node is not a swarm manager",
            ));
        }

        let request = ServiceCreate {
            name: name.clone(),
            image: image.primary_tag().to_string(),
            replicas,
            networks: vec![network.name().to_string()],
            constraints: vec![MANAGER_CONSTRAINT.to_string()],
            env: environment
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
            labels: tracking_labels(),
        };
        tracing::info!(
            "docker service create --name {} --detach=true --network {} --replicas {} --constraint \"{}\" {}",
            request.name,
            network.name(),
            replicas,
            MANAGER_CONSTRAINT,
            request.image
        );
        let id = self
            .engine
            .create_service(&request)
            .await
            .map_err(|e| FixtureError::provision(ResourceKind::Service, &name, e))?;
        tracing::info!("service id = {}", id);

        wait_for_start(startup_grace(image, self.default_start_period)).await;
        Ok(ResourceHandle::owned(ResourceKind::Service, id, name))
    }
}

#[async_trait]
impl Reclaim for ServiceProvisioner {
    async fn exists(&self, handle: &ResourceHandle) -> Result<bool> {
        Ok(self.engine.service_exists(&handle.id).await?)
    }

    /// Volumes created by the service's tasks are left behind.
    async fn remove(&self, handle: &ResourceHandle) -> Result<()> {
        tracing::info!("docker service rm {}", handle.name);
        match self.engine.remove_service(&handle.id).await {
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
    use crate::provision::{NetworkDriver, NetworkProvisioner, SwarmProvisioner};
    use crate::testing::FakeEngine;

    #[tokio::test(start_paused = true)]
    async fn test_service_on_overlay() {
        let engine = Arc::new(FakeEngine::new().with_image(FakeEngine::python_hello()));
        SwarmProvisioner::new(engine.clone()).init().await.unwrap();
        let network = NetworkProvisioner::new(engine.clone(), Duration::from_secs(5))
            .create(NetworkDriver::Overlay, "python-hello")
            .await
            .unwrap();

        let services = ServiceProvisioner::new(engine.clone(), Duration::from_secs(1));
        let env = BTreeMap::from([("FOO".to_string(), "2018".to_string())]);
        let handle = services
            .create(&FakeEngine::python_hello(), "", "python-hello", &network, 1, &env)
            .await
            .unwrap();

        assert!(handle.name.starts_with("pytest_python-hello_"));
        let created = engine.created_service(&handle.id).unwrap();
        assert_eq!(created.replicas, 1);
        assert_eq!(created.networks, vec![network.name().to_string()]);
        assert_eq!(created.constraints, vec![MANAGER_CONSTRAINT.to_string()]);
        assert_eq!(created.env, vec!["FOO=2018".to_string()]);
        assert!(services.exists(&handle).await.unwrap());

        services.remove(&handle).await.unwrap();
        assert!(!services.exists(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_service_requires_swarm() {
        let engine = Arc::new(FakeEngine::new());
        let network = NetworkProvisioner::new(engine.clone(), Duration::ZERO)
            .create(NetworkDriver::Host, "python-hello")
            .await
            .unwrap();
        let err = ServiceProvisioner::new(engine.clone(), Duration::ZERO)
            .create(
                &FakeEngine::python_hello(),
                "",
                "python-hello",
                &network,
                1,
                &BTreeMap::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FixtureError::Provision {
                kind: ResourceKind::Service,
                ..
            }
        ));
        assert!(engine.calls_starting_with("create_service").is_empty());
    }
}
