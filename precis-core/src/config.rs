//! Node configuration.
//!
//! A single TOML document shared by every node in the cluster, with
//! sections for the membership table, network timing, the AI collaborator
//! credentials and task handling. `${NAME}` placeholders inside string
//! values are substituted from the process environment before
//! deserialization, so credentials never have to live in the file itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::job::NodeId;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub nodes: Vec<NodeSpec>,
    pub network: NetworkConfig,
    pub api: ApiConfig,
    pub tasks: TasksConfig,
}

/// One row of the static membership table.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
}

impl NodeSpec {
    /// Base URL peers use to reach this node.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

/// Cluster timing, all in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub heartbeat_interval: f64,
    pub leader_timeout: f64,
    pub election_timeout: f64,
}

impl NetworkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval)
    }

    pub fn leader_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.leader_timeout)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.election_timeout)
    }
}

/// Credentials for the AI completion collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    pub max_retries: u32,
    pub timeout_seconds: f64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl TasksConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "mistralai/mixtral-8x7b-instruct".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_max_pending() -> usize {
    256
}

impl Config {
    /// Load and validate the config document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    /// Parse a config document, substituting `${NAME}` placeholders from the
    /// environment inside every string value.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut value: toml::Value = toml::from_str(raw)?;
        substitute_env(&mut value);
        let config: Config = value
            .try_into()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("nodes table is empty".into()));
        }
        let mut seen = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if seen.contains(&node.id) {
                return Err(Error::Config(format!("duplicate node id {}", node.id)));
            }
            seen.push(node.id);
        }
        if self.network.heartbeat_interval <= 0.0
            || self.network.leader_timeout <= 0.0
            || self.network.election_timeout <= 0.0
        {
            return Err(Error::Config("network intervals must be positive".into()));
        }
        if self.tasks.timeout_seconds <= 0.0 {
            return Err(Error::Config("tasks.timeout_seconds must be positive".into()));
        }
        Ok(())
    }
}

fn substitute_env(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => {
            if s.contains("${") {
                *s = expand_placeholders(s);
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                substitute_env(item);
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute_env(item);
            }
        }
        _ => {}
    }
}

/// Replace every `${NAME}` occurrence with the environment value, or the
/// empty string when the variable is unset.
fn expand_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // unterminated placeholder, keep verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[nodes]]
        id = 1
        ip = "127.0.0.1"
        port = 8001

        [[nodes]]
        id = 2
        ip = "127.0.0.1"
        port = 8002

        [network]
        heartbeat_interval = 1.0
        leader_timeout = 5.0
        election_timeout = 3.0

        [api]
        api_key = "${PRECIS_TEST_KEY}"

        [tasks]
        max_retries = 3
        timeout_seconds = 60.0
    "#;

    #[test]
    fn parses_sample_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.node(2).unwrap().port, 8002);
        assert_eq!(config.network.leader_timeout(), Duration::from_secs(5));
        assert_eq!(config.tasks.max_retries, 3);
        assert_eq!(config.tasks.output_dir, PathBuf::from("outputs"));
    }

    #[test]
    fn substitutes_environment_placeholders() {
        std::env::set_var("PRECIS_TEST_KEY", "sekrit");
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.api.api_key, "sekrit");
        std::env::remove_var("PRECIS_TEST_KEY");
    }

    #[test]
    fn unset_placeholder_becomes_empty() {
        std::env::remove_var("PRECIS_NO_SUCH_VAR");
        let expanded = expand_placeholders("x${PRECIS_NO_SUCH_VAR}y");
        assert_eq!(expanded, "xy");
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let raw = SAMPLE.replace("id = 2", "id = 1");
        let err = Config::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn rejects_missing_section() {
        let raw = SAMPLE.replace("[network]", "[networkx]");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn rejects_empty_node_table() {
        let raw = SAMPLE.replace("[[nodes]]", "[[nodesx]]");
        assert!(Config::parse(&raw).is_err());
    }
}
