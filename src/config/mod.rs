//! Settings for fixture sessions.
//!
//! Values are resolved in this order (first wins):
//! 1. environment variables (after loading `.env` with dotenvy)
//! 2. the TOML settings file (`FIXTURES_SETTINGS`, default `./fixtures.toml`)
//! 3. built-in defaults

mod helpers;
pub mod matrix;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub use crate::error::ConfigError;
use crate::config::helpers::{optional_env, parse_optional_env};

/// Service name used when a test module does not declare its own.
pub const DEFAULT_SERVICE_NAME: &str = "python-hello";

/// Image that the default service name maps to.
pub const DEFAULT_SERVICE_IMAGE: &str = "google/python-hello";

/// Default settings file, looked up in the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "fixtures.toml";

/// Resolved settings shared by every session.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Name of the service under test.
    pub service_name: String,
    /// Registry prefix for the image under test (`DOCKER_REGISTRY`).
    pub registry: String,
    /// Tag of the image under test (`DOCKER_IMAGE_TAG`).
    pub image_tag: String,
    /// Free-form string option exposed to tests (`--foo` equivalent).
    pub foo: String,
    /// Ini-style `hello` setting, unset unless configured.
    pub hello: Option<String>,
    /// Program invoked by the CLI bridge.
    pub docker_cli: String,
    /// Working directory for CLI bridge subprocesses, against which relative
    /// compose file paths resolve. `None` runs them from the process working
    /// directory. Projects that keep their compose files in a `fixtures`
    /// directory set this to `fixtures` (`FIXTURES_CLI_DIR=fixtures`).
    pub cli_dir: Option<PathBuf>,
    /// Wait after creating a custom network.
    pub network_settle: Duration,
    /// Grace period when the image declares no health check.
    pub default_start_period: Duration,
    /// Parent directory for bind-mounted volume directories.
    pub tmp_root: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            registry: String::new(),
            image_tag: "latest".to_string(),
            foo: "2018".to_string(),
            hello: None,
            docker_cli: "docker".to_string(),
            cli_dir: None,
            network_settle: Duration::from_secs(5),
            default_start_period: Duration::from_secs(1),
            tmp_root: None,
        }
    }
}

/// Shape of the optional TOML settings file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    service_name: Option<String>,
    registry: Option<String>,
    image_tag: Option<String>,
    foo: Option<String>,
    hello: Option<String>,
    docker_cli: Option<String>,
    cli_dir: Option<PathBuf>,
    network_settle_secs: Option<u64>,
    default_start_period_secs: Option<u64>,
    tmp_root: Option<PathBuf>,
}

impl Settings {
    /// Resolve settings from `.env`, the environment and the settings file.
    pub fn resolve() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let path = optional_env("FIXTURES_SETTINGS")?
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        let file = match path {
            Some(path) => load_file(&path)?,
            None => {
                let path = Path::new(DEFAULT_SETTINGS_FILE);
                if path.exists() {
                    load_file(path)?
                } else {
                    FileSettings::default()
                }
            }
        };

        Self::resolve_with(file)
    }

    /// Parse a settings file and layer the environment on top of it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::resolve_with(load_file(path)?)
    }

    fn resolve_with(file: FileSettings) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let network_settle_secs = file
            .network_settle_secs
            .unwrap_or(defaults.network_settle.as_secs());
        let default_start_period_secs = file
            .default_start_period_secs
            .unwrap_or(defaults.default_start_period.as_secs());

        Ok(Self {
            service_name: optional_env("FIXTURES_SERVICE_NAME")?
                .filter(|s| !s.is_empty())
                .or(file.service_name)
                .unwrap_or(defaults.service_name),
            registry: optional_env("DOCKER_REGISTRY")?
                .or(file.registry)
                .unwrap_or(defaults.registry),
            image_tag: optional_env("DOCKER_IMAGE_TAG")?
                .filter(|s| !s.is_empty())
                .or(file.image_tag)
                .unwrap_or(defaults.image_tag),
            foo: optional_env("FIXTURES_FOO")?
                .or(file.foo)
                .unwrap_or(defaults.foo),
            hello: optional_env("FIXTURES_HELLO")?.or(file.hello),
            docker_cli: optional_env("FIXTURES_DOCKER_CLI")?
                .filter(|s| !s.is_empty())
                .or(file.docker_cli)
                .unwrap_or(defaults.docker_cli),
            cli_dir: optional_env("FIXTURES_CLI_DIR")?
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .or(file.cli_dir),
            network_settle: Duration::from_secs(parse_optional_env(
                "FIXTURES_NETWORK_SETTLE_SECS",
                network_settle_secs,
            )?),
            default_start_period: Duration::from_secs(parse_optional_env(
                "FIXTURES_DEFAULT_START_PERIOD_SECS",
                default_start_period_secs,
            )?),
            tmp_root: file.tmp_root,
        })
    }

    /// Fully qualified reference of the image under test.
    ///
    /// `[<registry>/]<image>:<tag>`, where the default service maps to
    /// `google/python-hello`.
    pub fn image_reference(&self) -> String {
        let image = if self.service_name == DEFAULT_SERVICE_NAME {
            DEFAULT_SERVICE_IMAGE
        } else {
            self.service_name.as_str()
        };
        let registry = self.registry.trim_end_matches('/');
        if registry.is_empty() {
            format!("{}:{}", image, self.image_tag)
        } else {
            format!("{}/{}:{}", registry, image, self.image_tag)
        }
    }
}

fn load_file(path: &Path) -> Result<FileSettings, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    toml::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
