//! Error types for fixture provisioning and teardown.

use thiserror::Error;

use crate::engine::EngineError;
use crate::provision::ResourceKind;

/// Result type for fixture operations.
pub type Result<T> = std::result::Result<T, FixtureError>;

/// Errors that can occur while provisioning or tearing down fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// The engine refused to create a resource.
    #[error("Failed to provision {kind} '{name}': {reason}")]
    Provision {
        /// Kind of resource being created.
        kind: ResourceKind,
        /// Requested resource name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// A named lookup found no match.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Kind of resource looked up.
        kind: ResourceKind,
        /// Name that was looked up.
        name: String,
    },

    /// The CLI bridge observed an unexpected exit code.
    #[error(
        "`{command}` exited with {actual:?}, expected {expected}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}"
    )]
    Subprocess {
        /// Full command line that was run.
        command: String,
        /// Exit code the caller expected.
        expected: i32,
        /// Observed exit code (`None` when killed by a signal or never spawned).
        actual: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Removing a resource failed.
    #[error("Failed to remove {kind} '{id}': {reason}")]
    Teardown {
        /// Kind of resource being removed.
        kind: ResourceKind,
        /// Engine id of the resource.
        id: String,
        /// Reason for failure.
        reason: String,
    },

    /// The CLI bridge produced output that is not valid JSON.
    #[error("Malformed CLI output line '{line}': {reason}")]
    Parse {
        /// The offending line.
        line: String,
        /// Parser message.
        reason: String,
    },

    /// Configuration could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Engine API error outside of provisioning.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FixtureError {
    /// Wrap an engine error raised while creating a resource.
    pub(crate) fn provision(kind: ResourceKind, name: &str, err: impl std::fmt::Display) -> Self {
        Self::Provision {
            kind,
            name: name.to_string(),
            reason: err.to_string(),
        }
    }

    /// True when the error is a not-found condition, whatever layer raised it.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Engine(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Errors raised while resolving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value was present but could not be interpreted.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// Setting or environment variable name.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// The settings file could not be parsed.
    #[error("Failed to parse settings file {path}: {reason}")]
    Parse {
        /// Path of the settings file.
        path: String,
        /// Parser message.
        reason: String,
    },

    /// I/O error while reading settings or preparing directories.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
