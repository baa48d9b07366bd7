//! Provisioners: create and remove one kind of engine resource each.
//!
//! Creation is a typed operation on each provisioner. Removal goes through
//! the [`Reclaim`] capability so a session can tear down any handle it
//! recorded without knowing how it was made.

pub mod container;
pub mod image;
pub mod network;
pub mod service;
pub mod swarm;
pub mod volume;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::ImageMetadata;
use crate::error::Result;

pub use container::ContainerProvisioner;
pub use image::resolve_image;
pub use network::{NetworkDescriptor, NetworkDriver, NetworkProvisioner};
pub use service::ServiceProvisioner;
pub use swarm::SwarmProvisioner;
pub use volume::{VolumeBinding, VolumeKind, VolumeProvisioner, VolumeRequest, VolumeSet};

/// Kinds of resources a session can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Network,
    Volume,
    DataContainer,
    Container,
    ClientContainer,
    Swarm,
    Service,
    Stack,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Volume => "volume",
            Self::DataContainer => "data container",
            Self::Container => "container",
            Self::ClientContainer => "client container",
            Self::Swarm => "swarm",
            Self::Service => "service",
            Self::Stack => "stack",
        }
    }

    /// True for the three container flavours.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Self::DataContainer | Self::Container | Self::ClientContainer
        )
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a session may remove a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created by the session; removed at teardown.
    Owned,
    /// Discovered (built-in networks, a pre-existing swarm); never removed.
    Borrowed,
}

/// Reference to a resource, returned once it exists.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    /// Engine-assigned id (the name, for volumes and stacks).
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Last observed status; may be stale.
    pub status: Option<String>,
    pub ownership: Ownership,
}

impl ResourceHandle {
    pub fn owned(kind: ResourceKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
            created_at: Utc::now(),
            status: None,
            ownership: Ownership::Owned,
        }
    }

    pub fn borrowed(kind: ResourceKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ownership: Ownership::Borrowed,
            ..Self::owned(kind, id, name)
        }
    }

    pub fn with_status(mut self, status: Option<String>) -> Self {
        self.status = status;
        self
    }

    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    /// First twelve characters of the id, like `docker ps` prints.
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(12) {
            Some((end, _)) => &self.id[..end],
            None => &self.id,
        }
    }
}

/// Existence check and removal for one kind of resource.
///
/// `remove` must treat an already-absent resource as success.
#[async_trait]
pub trait Reclaim: Send + Sync {
    async fn exists(&self, handle: &ResourceHandle) -> Result<bool>;
    async fn remove(&self, handle: &ResourceHandle) -> Result<()>;
}

/// How long to wait after starting something built from `image`.
///
/// The image's declared health-check start period in whole seconds, or
/// `default` when the image declares no health check.
pub fn startup_grace(image: &ImageMetadata, default: Duration) -> Duration {
    match image.health_start_period_ns {
        Some(ns) => Duration::from_secs(u64::try_from(ns / 1_000_000_000).unwrap_or(0)),
        None => default,
    }
}

/// Sleep for a startup grace period, logging it first.
pub(crate) async fn wait_for_start(grace: Duration) {
    tracing::info!("waiting {} seconds for service to start", grace.as_secs());
    tokio::time::sleep(grace).await;
}

/// Last path component of a mount target (`/var/lib/data` → `data`).
pub(crate) fn target_basename(target: &str) -> &str {
    std::path::Path::new(target)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("root")
}
