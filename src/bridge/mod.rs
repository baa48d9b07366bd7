//! Engine operations that only the `docker` command line offers.
//!
//! [`CliClient`] runs the CLI as a subprocess, captures both output streams
//! and checks the exit code. Stack management lives in [`stack`], swarm
//! membership and service tasks in [`swarm`], both on top of
//! [`CliClient::dispatch`].
//!
//! Subprocesses run from [`Settings::cli_dir`] when it is set, typically the
//! project's `fixtures` directory, so relative compose file paths resolve
//! there.

pub mod stack;
pub mod swarm;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::Settings;
use crate::error::{FixtureError, Result};

pub use stack::StackRecord;
pub use swarm::{SwarmRecord, TaskRecord};

/// Captured output of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Client for the engine's command-line tool.
#[derive(Debug, Clone)]
pub struct CliClient {
    program: String,
    working_dir: Option<PathBuf>,
}

impl Default for CliClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CliClient {
    /// Client for `docker` run from the process working directory.
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
            working_dir: None,
        }
    }

    /// Client configured from resolved settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            program: settings.docker_cli.clone(),
            working_dir: settings.cli_dir.clone(),
        }
    }

    /// Use a different executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Run subprocesses from `dir`, e.g. the `fixtures` directory holding
    /// the compose files stacks are deployed from.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Run `<program> <args...>` and require `expected_exit_code`.
    ///
    /// Any other exit code, a signal, or a failure to spawn yields
    /// [`FixtureError::Subprocess`] carrying both captured streams.
    pub async fn dispatch<S: AsRef<str>>(
        &self,
        args: &[S],
        expected_exit_code: i32,
    ) -> Result<ProcessOutput> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let command_line = std::iter::once(self.program.as_str())
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!("Running process: {}", command_line);

        let output = cmd.output().await.map_err(|e| FixtureError::Subprocess {
            command: command_line.clone(),
            expected: expected_exit_code,
            actual: None,
            stdout: String::new(),
            stderr: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let actual = output.status.code();

        if actual != Some(expected_exit_code) {
            tracing::error!(
                command = %command_line,
                exit_code = ?actual,
                "Stderr: {}\nStdout: {}",
                stderr,
                stdout
            );
            return Err(FixtureError::Subprocess {
                command: command_line,
                expected: expected_exit_code,
                actual,
                stdout,
                stderr,
            });
        }

        Ok(ProcessOutput { stdout, stderr })
    }

    /// Client and server version, like `docker version --format '{{json .}}'`.
    pub async fn version(&self) -> Result<serde_json::Value> {
        let output = self
            .dispatch(&["version", "--format", "{{json .}}"], 0)
            .await?;
        let trimmed = output.stdout.trim();
        serde_json::from_str(trimmed).map_err(|e| FixtureError::Parse {
            line: trimmed.to_string(),
            reason: e.to_string(),
        })
    }
}
