//! Docker availability checks with platform-specific guidance.
//!
//! Fixtures need both halves of Docker: the daemon (reached over its API)
//! and the `docker` binary (used by the CLI bridge for stacks). A check
//! reports which half is missing so a test run can be skipped with a useful
//! message instead of failing on the first fixture.

use std::process::Stdio;

/// Docker availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerStatus {
    /// CLI binary found and daemon responding to ping.
    Available,
    /// CLI binary not found.
    NotInstalled,
    /// Binary found but daemon not responding.
    NotRunning,
}

impl DockerStatus {
    /// Returns true if Docker is available and ready.
    pub fn is_ok(&self) -> bool {
        matches!(self, DockerStatus::Available)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DockerStatus::Available => "available",
            DockerStatus::NotInstalled => "not installed",
            DockerStatus::NotRunning => "not running",
        }
    }
}

/// Host platform, for guidance only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    fn uses_desktop(&self) -> bool {
        !matches!(self, Platform::Linux)
    }
}

/// Result of a Docker detection check.
#[derive(Debug, Clone, Copy)]
pub struct DockerDetection {
    pub status: DockerStatus,
    pub platform: Platform,
}

impl DockerDetection {
    /// What to do about the status; empty when Docker is available.
    pub fn hint(&self) -> &'static str {
        match (self.status, self.platform.uses_desktop()) {
            (DockerStatus::Available, _) => "",
            (DockerStatus::NotInstalled, true) => {
                "Docker Desktop is required: https://docs.docker.com/desktop/"
            }
            (DockerStatus::NotInstalled, false) => {
                "Docker Engine is required: https://docs.docker.com/engine/install/"
            }
            (DockerStatus::NotRunning, true) => "Docker Desktop is installed but not started",
            (DockerStatus::NotRunning, false) => {
                "The Docker daemon is not running; try: sudo systemctl start docker"
            }
        }
    }
}

/// Check whether the CLI `program` is installed and the daemon is running.
pub async fn check_docker(program: &str) -> DockerDetection {
    let platform = Platform::current();

    if !binary_runs(program).await {
        return DockerDetection {
            status: DockerStatus::NotInstalled,
            platform,
        };
    }

    let status = if crate::engine::connect_docker().await.is_ok() {
        DockerStatus::Available
    } else {
        DockerStatus::NotRunning
    };

    DockerDetection { status, platform }
}

/// True if `<program> --version` can be spawned and exits successfully.
async fn binary_runs(program: &str) -> bool {
    tokio::process::Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_per_status() {
        for platform in [Platform::MacOS, Platform::Linux, Platform::Windows] {
            let hint = |status| DockerDetection { status, platform }.hint();
            assert!(hint(DockerStatus::Available).is_empty());
            assert!(hint(DockerStatus::NotInstalled).contains("docs.docker.com"));
            assert!(!hint(DockerStatus::NotRunning).is_empty());
        }
    }

    #[test]
    fn test_docker_status_display() {
        assert_eq!(DockerStatus::Available.as_str(), "available");
        assert_eq!(DockerStatus::NotInstalled.as_str(), "not installed");
        assert_eq!(DockerStatus::NotRunning.as_str(), "not running");
        assert!(DockerStatus::Available.is_ok());
        assert!(!DockerStatus::NotRunning.is_ok());
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_installed() {
        let detection = check_docker("definitely-not-a-docker-binary-7f3a").await;
        assert_eq!(detection.status, DockerStatus::NotInstalled);
        assert!(detection.hint().contains("is required"));
    }
}
