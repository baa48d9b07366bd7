//! Volume bindings for the mount points an image declares.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;

use crate::engine::{EngineError, ImageMetadata, SharedEngine, VolumeCreate, tracking_labels};
use crate::error::{FixtureError, Result};
use crate::naming::{desired_or_random, sanitize_token};
use crate::provision::{Reclaim, ResourceHandle, ResourceKind, target_basename};

/// How a container's declared volumes are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeKind {
    /// Host directories under the session's temporary root.
    Bind,
    /// Created implicitly by the engine with the container.
    Anonymous,
    /// Engine-managed named volumes.
    Named,
    /// Shared from a data container.
    Container,
}

impl VolumeKind {
    pub const ALL: [VolumeKind; 4] = [Self::Bind, Self::Anonymous, Self::Named, Self::Container];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Anonymous => "anonymous",
            Self::Named => "named",
            Self::Container => "container",
        }
    }
}

impl std::fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!("'{s}' is not a volume kind, expected bind, anonymous, named or container")
            })
    }
}

/// Volumes to back, with an optional name and extra mount points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub kind: VolumeKind,
    /// Empty for a generated name. Names the volume (or `<name>_<basename>`
    /// per target when there are several), the bind directory, or the data
    /// container, depending on `kind`.
    pub name: String,
    /// Mount points backed in addition to the ones the image declares.
    pub targets: Vec<String>,
}

impl VolumeRequest {
    pub fn new(kind: VolumeKind) -> Self {
        Self {
            kind,
            name: String::new(),
            targets: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    /// The image's mount points followed by the explicit ones, each once.
    pub fn targets_for(&self, image: &ImageMetadata) -> Vec<String> {
        let mut targets: Vec<String> = Vec::with_capacity(image.volumes.len() + self.targets.len());
        for target in image.volumes.iter().chain(&self.targets) {
            if !targets.contains(target) {
                targets.push(target.clone());
            }
        }
        targets
    }
}

impl From<VolumeKind> for VolumeRequest {
    fn from(kind: VolumeKind) -> Self {
        Self::new(kind)
    }
}

/// One declared mount point and what backs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub kind: VolumeKind,
    /// Host path, volume name or data container id; empty for anonymous.
    pub source: String,
    pub target: String,
}

impl VolumeBinding {
    /// `source:target`, when the binding is expressed as a bind spec.
    pub fn bind_spec(&self) -> Option<String> {
        match self.kind {
            VolumeKind::Bind | VolumeKind::Named => Some(format!("{}:{}", self.source, self.target)),
            VolumeKind::Anonymous | VolumeKind::Container => None,
        }
    }
}

/// Bindings for every mount point of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSet {
    pub kind: VolumeKind,
    pub bindings: Vec<VolumeBinding>,
    /// Named volumes created for this set.
    pub handles: Vec<ResourceHandle>,
    /// Data container the bindings share, for [`VolumeKind::Container`].
    pub data_container: Option<ResourceHandle>,
    /// Host directory holding bind sources, for [`VolumeKind::Bind`].
    pub bind_dir: Option<PathBuf>,
}

impl VolumeSet {
    /// Container ids to pass as `volumes_from`.
    pub fn volumes_from(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.kind == VolumeKind::Container)
            .map(|b| b.source.clone())
            .collect();
        ids.dedup();
        ids
    }

    pub fn bind_specs(&self) -> Vec<String> {
        self.bindings.iter().filter_map(VolumeBinding::bind_spec).collect()
    }
}

/// Creates backing storage for declared volumes.
#[derive(Clone)]
pub struct VolumeProvisioner {
    engine: SharedEngine,
    service_name: String,
    bind_root: PathBuf,
}

impl VolumeProvisioner {
    pub fn new(engine: SharedEngine, service_name: impl Into<String>, bind_root: PathBuf) -> Self {
        Self {
            engine,
            service_name: service_name.into(),
            bind_root,
        }
    }

    /// Back every volume `image` declares, plus the request's own targets,
    /// with storage of the requested kind.
    ///
    /// The bind directory is named after the request, or `test_name` when
    /// the request has no name. [`VolumeKind::Container`] needs the data
    /// container to share from.
    pub async fn create(
        &self,
        request: &VolumeRequest,
        image: &ImageMetadata,
        test_name: &str,
        data_container: Option<&ResourceHandle>,
    ) -> Result<VolumeSet> {
        let kind = request.kind;
        let targets = request.targets_for(image);
        let mut set = VolumeSet {
            kind,
            bindings: Vec::with_capacity(targets.len()),
            handles: Vec::new(),
            data_container: data_container.cloned(),
            bind_dir: None,
        };

        match kind {
            VolumeKind::Anonymous => {
                tracing::info!("anonymous volumes will be created with the container");
                for target in &targets {
                    set.bindings.push(VolumeBinding {
                        kind,
                        source: String::new(),
                        target: target.clone(),
                    });
                }
            }
            VolumeKind::Named => {
                for target in &targets {
                    let name = if request.name.is_empty() || targets.len() == 1 {
                        request.name.clone()
                    } else {
                        format!("{}_{}", request.name, target_basename(target))
                    };
                    if !name.is_empty() && set.handles.iter().any(|h| h.name == name) {
                        self.roll_back(&set.handles).await;
                        return Err(FixtureError::provision(
                            ResourceKind::Volume,
                            &name,
                            "volume already backs another mount point",
                        ));
                    }
                    let handle = match self.named_volume(&name, target).await {
                        Ok(handle) => handle,
                        Err(e) => {
                            self.roll_back(&set.handles).await;
                            return Err(e);
                        }
                    };
                    set.bindings.push(VolumeBinding {
                        kind,
                        source: handle.name.clone(),
                        target: target.clone(),
                    });
                    set.handles.push(handle);
                }
            }
            VolumeKind::Bind => {
                let base = if request.name.is_empty() {
                    test_name
                } else {
                    &request.name
                };
                let dir = numbered_dir(&self.bind_root, &sanitize_token(base)).await?;
                for target in &targets {
                    let source = dir.join(self.service_basename(target));
                    tracing::info!("mkdir {}", source.display());
                    match tokio::fs::create_dir(&source).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                            return Err(FixtureError::provision(
                                ResourceKind::Volume,
                                &source.to_string_lossy(),
                                "host directory already backs another mount point",
                            ));
                        }
                        Err(e) => return Err(e.into()),
                    }
                    set.bindings.push(VolumeBinding {
                        kind,
                        source: source.to_string_lossy().into_owned(),
                        target: target.clone(),
                    });
                }
                set.bind_dir = Some(dir);
            }
            VolumeKind::Container => {
                let data = data_container.ok_or_else(|| {
                    FixtureError::provision(
                        ResourceKind::Volume,
                        &self.service_name,
                        "container-shared volumes need a data container",
                    )
                })?;
                for target in &targets {
                    set.bindings.push(VolumeBinding {
                        kind,
                        source: data.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        Ok(set)
    }

    async fn named_volume(&self, desired: &str, target: &str) -> Result<ResourceHandle> {
        let name = desired_or_random(desired, Some(&self.service_basename(target)));
        tracing::info!(
            "docker volume create --label {} --driver local {}",
            crate::engine::TRACKING_LABEL,
            name
        );
        let request = VolumeCreate {
            name: name.clone(),
            driver: "local".to_string(),
            labels: tracking_labels(),
        };
        let created = self
            .engine
            .create_volume(&request)
            .await
            .map_err(|e| FixtureError::provision(ResourceKind::Volume, &name, e))?;
        Ok(ResourceHandle::owned(ResourceKind::Volume, created.clone(), created))
    }

    /// Remove volumes created before a later one failed; they were never
    /// handed to a session.
    async fn roll_back(&self, handles: &[ResourceHandle]) {
        for handle in handles {
            if let Err(e) = self.remove(handle).await {
                tracing::warn!("Failed to roll back volume {}: {}", handle.id, e);
            }
        }
    }

    /// `<service>_<basename>`, e.g. `python-hello_data` for `/data`.
    fn service_basename(&self, target: &str) -> String {
        format!("{}_{}", self.service_name, target_basename(target))
    }
}

const MAX_NUMBERED_DIRS: u32 = 10_000;

/// Create `root/<base><n>` for the first free `n`, starting at 0.
async fn numbered_dir(root: &Path, base: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(root).await?;
    for n in 0..MAX_NUMBERED_DIRS {
        let candidate = root.join(format!("{base}{n}"));
        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("{MAX_NUMBERED_DIRS} directories named {base}<n> already exist"),
    )
    .into())
}

#[async_trait]
impl Reclaim for VolumeProvisioner {
    async fn exists(&self, handle: &ResourceHandle) -> Result<bool> {
        Ok(self.engine.volume_exists(&handle.id).await?)
    }

    async fn remove(&self, handle: &ResourceHandle) -> Result<()> {
        tracing::info!("docker volume rm {}", handle.id);
        match self.engine.remove_volume(&handle.id).await {
            Ok(()) | Err(EngineError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
