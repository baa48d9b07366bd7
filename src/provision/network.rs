//! Networks: built-in ones are looked up, everything else is created.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::{EngineError, NetworkCreate, SharedEngine, tracking_labels};
use crate::error::{FixtureError, Result};
use crate::naming::desired_or_random;
use crate::provision::{Ownership, Reclaim, ResourceHandle, ResourceKind};

/// Network flavours a fixture can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkDriver {
    /// The engine's built-in `host` network.
    Host,
    /// The engine's built-in default bridge.
    Default,
    /// A fresh user-defined bridge.
    Bridge,
    /// A fresh attachable overlay; needs a swarm.
    Overlay,
}

impl NetworkDriver {
    pub const ALL: [NetworkDriver; 4] = [Self::Host, Self::Default, Self::Bridge, Self::Overlay];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Default => "default",
            Self::Bridge => "bridge",
            Self::Overlay => "overlay",
        }
    }

    /// Name of the pre-existing network, for built-in drivers.
    pub fn builtin_name(&self) -> Option<&'static str> {
        match self {
            Self::Host => Some("host"),
            Self::Default => Some("bridge"),
            Self::Bridge | Self::Overlay => None,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin_name().is_some()
    }

    pub fn requires_swarm(&self) -> bool {
        matches!(self, Self::Overlay)
    }

    /// Engine driver name used when creating the network.
    fn engine_driver(&self) -> &'static str {
        match self {
            Self::Overlay => "overlay",
            _ => "bridge",
        }
    }
}

impl std::fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkDriver {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|driver| driver.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!("'{s}' is not a network driver, expected host, default, bridge or overlay")
            })
    }
}

/// A network ready for containers to join.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkDescriptor {
    pub handle: ResourceHandle,
    pub driver: NetworkDriver,
    pub attachable: bool,
}

impl NetworkDescriptor {
    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn is_builtin(&self) -> bool {
        self.handle.ownership == Ownership::Borrowed
    }

    pub fn is_host(&self) -> bool {
        self.driver == NetworkDriver::Host
    }

    /// True for the engine's default bridge, which containers join implicitly.
    pub fn is_default_bridge(&self) -> bool {
        self.driver == NetworkDriver::Default
    }
}

/// Looks up built-in networks and creates the rest.
#[derive(Clone)]
pub struct NetworkProvisioner {
    engine: SharedEngine,
    settle: Duration,
}

impl NetworkProvisioner {
    pub fn new(engine: SharedEngine, settle: Duration) -> Self {
        Self { engine, settle }
    }

    /// Provide a network of `driver`, named after `base` when one is created.
    ///
    /// Created networks are attachable and followed by the settle pause.
    /// Callers must have a swarm before asking for an overlay.
    pub async fn create(&self, driver: NetworkDriver, base: &str) -> Result<NetworkDescriptor> {
        self.create_named(driver, "", base).await
    }

    /// [`create`](Self::create), naming a created network `name` unless it
    /// is empty. Built-in networks keep their own names.
    pub async fn create_named(
        &self,
        driver: NetworkDriver,
        name: &str,
        base: &str,
    ) -> Result<NetworkDescriptor> {
        if let Some(builtin) = driver.builtin_name() {
            return self.builtin(driver, builtin).await;
        }

        let name = desired_or_random(name, Some(base));
        tracing::info!(
            "docker network create --label {} --driver {} --attachable {}",
            crate::engine::TRACKING_LABEL,
            driver.engine_driver(),
            name
        );
        let request = NetworkCreate {
            name: name.clone(),
            driver: driver.engine_driver().to_string(),
            attachable: true,
            labels: tracking_labels(),
        };
        let info = self
            .engine
            .create_network(&request)
            .await
            .map_err(|e| FixtureError::provision(ResourceKind::Network, &name, e))?;

        tracing::info!(
            "waiting {} seconds for network creation to complete",
            self.settle.as_secs()
        );
        tokio::time::sleep(self.settle).await;

        Ok(NetworkDescriptor {
            handle: ResourceHandle::owned(ResourceKind::Network, info.id, info.name),
            driver,
            attachable: info.attachable,
        })
    }

    async fn builtin(&self, driver: NetworkDriver, name: &str) -> Result<NetworkDescriptor> {
        tracing::info!(
            "docker network ls --filter type=builtin --filter name={}",
            name
        );
        let networks = self
            .engine
            .list_networks(name)
            .await
            .map_err(|e| FixtureError::provision(ResourceKind::Network, name, e))?;

        // The engine filter matches substrings, so `bridge` also finds user bridges.
        let info = networks
            .into_iter()
            .find(|n| n.name == name)
            .ok_or_else(|| FixtureError::NotFound {
                kind: ResourceKind::Network,
                name: name.to_string(),
            })?;

        Ok(NetworkDescriptor {
            handle: ResourceHandle::borrowed(ResourceKind::Network, info.id, info.name),
            driver,
            attachable: info.attachable,
        })
    }
}

#[async_trait]
impl Reclaim for NetworkProvisioner {
    async fn exists(&self, handle: &ResourceHandle) -> Result<bool> {
        Ok(self.engine.network_exists(&handle.id).await?)
    }

    async fn remove(&self, handle: &ResourceHandle) -> Result<()> {
        if !handle.is_owned() {
            tracing::info!("no need to remove builtin network {}", handle.name);
            return Ok(());
        }
        tracing::info!("docker network rm {}", handle.id);
        match self.engine.remove_network(&handle.id).await {
            Ok(()) | Err(EngineError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
