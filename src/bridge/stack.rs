//! `docker stack` over the CLI bridge.

use serde::{Deserialize, Serialize};

use crate::bridge::CliClient;
use crate::error::{FixtureError, Result};

/// One row of `docker stack ls --format '{{json .}}'`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<String>,
    /// Service count, as text the way the CLI prints it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<String>,
}

impl StackRecord {
    /// Record that knows only the stack name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Parse newline-delimited JSON, one value per non-empty line.
///
/// A malformed line fails the whole parse; lines are never skipped.
pub fn parse_json_lines<T: for<'de> Deserialize<'de>>(text: &str) -> Result<Vec<T>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| FixtureError::Parse {
                line: line.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl CliClient {
    /// List stacks, like `docker stack ls`.
    pub async fn list_stacks(&self) -> Result<Vec<StackRecord>> {
        let output = self
            .dispatch(&["stack", "ls", "--format", "{{json .}}"], 0)
            .await?;
        parse_json_lines(&output.stdout)
    }

    /// Deploy `compose_file` as stack `name`.
    ///
    /// The CLI reports nothing useful on success, so the record carries the
    /// name only.
    pub async fn deploy_stack(&self, name: &str, compose_file: &str) -> Result<StackRecord> {
        tracing::info!("docker stack deploy --compose-file {} {}", compose_file, name);
        self.dispatch(&["stack", "deploy", "--compose-file", compose_file, name], 0)
            .await?;
        Ok(StackRecord::named(name))
    }

    /// Remove stack `name`, like `docker stack rm`.
    pub async fn remove_stack(&self, name: &str) -> Result<()> {
        tracing::info!("docker stack rm {}", name);
        self.dispatch(&["stack", "rm", name], 0).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_stack_lines() {
        let text = concat!(
            r#"{"Name":"demo","Namespace":"","Orchestrator":"Swarm","Services":"2"}"#,
            "\n\n",
            r#"{"Name":"web","Orchestrator":"Swarm","Services":"1"}"#,
            "\n",
        );

        let stacks: Vec<StackRecord> = parse_json_lines(text).unwrap();
        assert_eq!(
            stacks,
            vec![
                StackRecord {
                    name: "demo".to_string(),
                    namespace: Some(String::new()),
                    orchestrator: Some("Swarm".to_string()),
                    services: Some("2".to_string()),
                },
                StackRecord {
                    name: "web".to_string(),
                    namespace: None,
                    orchestrator: Some("Swarm".to_string()),
                    services: Some("1".to_string()),
                },
            ]
        );
    }

    #[test]
    fn test_parse_empty_output() {
        let stacks: Vec<StackRecord> = parse_json_lines("\n").unwrap();
        assert!(stacks.is_empty());
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let text = "{\"Name\":\"demo\"}\nnot json\n{\"Name\":\"web\"}\n";
        let err = parse_json_lines::<StackRecord>(text).unwrap_err();
        match err {
            FixtureError::Parse { line, .. } => assert_eq!(line, "not json"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
