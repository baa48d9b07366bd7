//! Single-node swarm membership.

use async_trait::async_trait;

use crate::engine::{EngineError, SharedEngine};
use crate::error::{FixtureError, Result};
use crate::provision::{Reclaim, ResourceHandle, ResourceKind};

/// Name recorded on swarm handles.
pub const SWARM_NAME: &str = "swarm";

/// Initializes a swarm, or adopts the one the node already belongs to.
#[derive(Clone)]
pub struct SwarmProvisioner {
    engine: SharedEngine,
}

impl SwarmProvisioner {
    pub fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }

    /// Make the local node a swarm manager.
    ///
    /// A swarm that already existed is returned as a borrowed handle, so
    /// teardown leaves it alone.
    pub async fn init(&self) -> Result<ResourceHandle> {
        tracing::info!("docker swarm init");
        match self.engine.init_swarm().await {
            Ok(node_id) => {
                tracing::info!("Swarm initialized: current node is now a manager.");
                Ok(ResourceHandle::owned(ResourceKind::Swarm, node_id, SWARM_NAME))
            }
            Err(EngineError::AlreadyInSwarm) => {
                tracing::info!("This node is already part of a swarm.");
                Ok(ResourceHandle::borrowed(ResourceKind::Swarm, "local", SWARM_NAME))
            }
            Err(e) => Err(FixtureError::provision(ResourceKind::Swarm, SWARM_NAME, e)),
        }
    }
}

#[async_trait]
impl Reclaim for SwarmProvisioner {
    async fn exists(&self, _handle: &ResourceHandle) -> Result<bool> {
        Ok(self.engine.swarm_active().await?)
    }

    async fn remove(&self, handle: &ResourceHandle) -> Result<()> {
        if !handle.is_owned() {
            tracing::info!("swarm existed before the session, leaving it running");
            return Ok(());
        }
        tracing::info!("docker swarm leave --force");
        match self.engine.leave_swarm(true).await {
            Ok(()) | Err(EngineError::NotFound { .. }) => {
                tracing::info!("Node left the swarm.");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::Engine;
    use crate::testing::FakeEngine;

    #[tokio::test]
    async fn test_init_owns_new_swarm() {
        let engine = Arc::new(FakeEngine::new());
        let swarms = SwarmProvisioner::new(engine.clone());
        let handle = swarms.init().await.unwrap();

        assert!(handle.is_owned());
        assert!(engine.swarm_active().await.unwrap());

        swarms.remove(&handle).await.unwrap();
        assert!(!engine.swarm_active().await.unwrap());
    }

    #[tokio::test]
    async fn test_existing_swarm_is_borrowed_and_kept() {
        let engine = Arc::new(FakeEngine::new().with_swarm());
        let swarms = SwarmProvisioner::new(engine.clone());
        let handle = swarms.init().await.unwrap();

        assert!(!handle.is_owned());
        swarms.remove(&handle).await.unwrap();
        assert!(engine.swarm_active().await.unwrap());
        assert!(engine.calls_starting_with("leave_swarm").is_empty());
    }
}
