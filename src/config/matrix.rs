//! The fixture parameter matrix.
//!
//! Each enum enumerates the values one parametrized fixture runs with. The
//! orchestrator, secret and log-handler parameters are descriptive only:
//! they label test cases but provision nothing.

use crate::provision::{NetworkDriver, VolumeKind};

/// Container orchestrator a test session targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OrchestratorKind {
    /// Plain engine, no orchestrator.
    #[default]
    None,
    Swarm,
    Kubernetes,
    Compose,
    Maestro,
}

impl OrchestratorKind {
    pub const ALL: [Self; 5] = [
        Self::None,
        Self::Swarm,
        Self::Kubernetes,
        Self::Compose,
        Self::Maestro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Swarm => "swarm",
            Self::Kubernetes => "kubernetes",
            Self::Compose => "compose",
            Self::Maestro => "maestro",
        }
    }

    /// Test-case id, e.g. `orchestrator=swarm`.
    pub fn param_id(&self) -> String {
        format!("orchestrator={}", self.as_str())
    }
}

/// How a test names the secrets it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecretMode {
    #[default]
    None,
    Named,
}

impl SecretMode {
    pub const ALL: [Self; 2] = [Self::None, Self::Named];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Named => "named",
        }
    }

    pub fn param_id(&self) -> String {
        format!("secret={}", self.as_str())
    }
}

/// Where the service under test sends its logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LogHandlerKind {
    #[default]
    None,
    Console,
    File,
}

impl LogHandlerKind {
    pub const ALL: [Self; 3] = [Self::None, Self::Console, Self::File];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Console => "console",
            Self::File => "file",
        }
    }

    pub fn param_id(&self) -> String {
        format!("handler={}", self.as_str())
    }
}

macro_rules! impl_display_from_str {
    ($ty:ty, $label:literal) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_lowercase();
                Self::ALL
                    .into_iter()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| {
                        let known: Vec<&str> = Self::ALL.iter().map(|v| v.as_str()).collect();
                        format!(
                            "invalid {} '{}', expected one of: {}",
                            $label,
                            s,
                            known.join(", ")
                        )
                    })
            }
        }
    };
}

impl_display_from_str!(OrchestratorKind, "orchestrator");
impl_display_from_str!(SecretMode, "secret mode");
impl_display_from_str!(LogHandlerKind, "log handler");

/// Replica counts the service fixture is parametrized with.
pub const SERVICE_REPLICAS: [u64; 1] = [1];

/// One cell of the container matrix: a network driver crossed with a volume kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixCase {
    pub network: NetworkDriver,
    pub volume: VolumeKind,
}

impl MatrixCase {
    /// Test-case id, e.g. `network=overlay-volume=named`.
    pub fn param_id(&self) -> String {
        format!("network={}-volume={}", self.network, self.volume)
    }
}

/// Every network × volume combination, network-major.
pub fn container_matrix() -> Vec<MatrixCase> {
    NetworkDriver::ALL
        .into_iter()
        .flat_map(|network| {
            VolumeKind::ALL
                .into_iter()
                .map(move |volume| MatrixCase { network, volume })
        })
        .collect()
}
