//! Runtime configuration types for Stepwise.
//!
//! `RuntimeConfig` represents the top-level `stepwise.toml`: bus selection,
//! circuit breaker thresholds, checkpoint store connection, engine limits,
//! workflow definitions and agent bindings. All sections have defaults so an
//! empty file is valid.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::{DefinitionError, WorkflowDefinition};

/// Top-level configuration, supplied at construction and never mutated
/// after the engine is initialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub checkpoint_store: CheckpointStoreConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,

    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl RuntimeConfig {
    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "circuit_breaker.failure_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.engine.step_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.step_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "agents.id",
                    reason: "must not be empty".to_string(),
                });
            }
            if !agent_ids.insert(agent.id.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.id.clone()));
            }
            if agent.kind == AgentKind::Http && agent.url.is_none() {
                return Err(ConfigError::MissingAgentUrl(agent.id.clone()));
            }
        }

        let mut workflow_ids = HashSet::new();
        for workflow in &self.workflows {
            workflow.validate()?;
            if !workflow_ids.insert(workflow.id.as_str()) {
                return Err(ConfigError::DuplicateWorkflow(workflow.id.clone()));
            }
            for step in &workflow.steps {
                let agent_id = workflow.agent_for(step).unwrap_or_default();
                if !agent_ids.contains(agent_id) {
                    return Err(ConfigError::UnknownAgent {
                        workflow_id: workflow.id.clone(),
                        step: step.clone(),
                        agent_id: agent_id.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn workflow(&self, id: &str) -> Option<&WorkflowDefinition> {
        self.workflows.iter().find(|w| w.id == id)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Which message bus adapter to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// In-process broadcast channels.
    #[default]
    Memory,
    /// Network broker over HTTP + Server-Sent Events.
    Broker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,

    /// Broker base URL (required when `kind = "broker"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Channel / publish queue capacity.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl BusConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bus.capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.kind == BusKind::Broker && self.url.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingBusUrl);
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Memory,
            url: None,
            capacity: default_bus_capacity(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker rejects calls before allowing a trial.
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,
}

impl CircuitBreakerConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down_secs: default_cool_down_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cool_down_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointStoreConfig {
    /// sqlx connection URL. Defaults to `sqlite://{data_dir}/stepwise.db?mode=rwc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// A step running longer than this counts as an agent failure.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

fn default_step_timeout_secs() -> u64 {
    300
}

/// How an agent is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// POST JSON to `url`.
    Http,
    /// Return the input unchanged (smoke tests).
    Echo,
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub kind: AgentKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,

    /// Environment variable holding a bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("workflow '{0}' is defined more than once")]
    DuplicateWorkflow(String),

    #[error("agent '{0}' is defined more than once")]
    DuplicateAgent(String),

    #[error("http agent '{0}' has no url")]
    MissingAgentUrl(String),

    #[error("workflow '{workflow_id}' step '{step}' references unknown agent '{agent_id}'")]
    UnknownAgent {
        workflow_id: String,
        step: String,
        agent_id: String,
    },

    #[error("bus kind 'broker' requires bus.url")]
    MissingBusUrl,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[bus]
kind = "broker"
url = "http://127.0.0.1:7070"
capacity = 64

[circuit_breaker]
failure_threshold = 3
cool_down_secs = 10

[checkpoint_store]
database_url = "sqlite::memory:"

[engine]
step_timeout_secs = 30

[[agents]]
id = "analyst-agent"
kind = "http"
url = "http://localhost:9000/analyst"
token_env = "ANALYST_TOKEN"

[[agents]]
id = "echo"
kind = "echo"

[[workflows]]
id = "content"
description = "analyst then echo"
steps = ["analyst", "review"]

[workflows.agents]
analyst = "analyst-agent"
review = "echo"
"#;

    #[test]
    fn test_runtime_config_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.bus.kind, BusKind::Memory);
        assert_eq!(config.bus.capacity, 1024);
        assert_eq!(config.bus.request_timeout_ms, 5_000);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.cool_down(), Duration::from_secs(60));
        assert_eq!(config.engine.step_timeout_secs, 300);
        assert!(config.checkpoint_store.database_url.is_none());
        assert!(config.workflows.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_runtime_config_full_file() {
        let config: RuntimeConfig = toml::from_str(FULL).unwrap();
        assert_eq!(config.bus.kind, BusKind::Broker);
        assert_eq!(config.bus.capacity, 64);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].token_env.as_deref(), Some("ANALYST_TOKEN"));

        let wf = config.workflow("content").unwrap();
        assert_eq!(wf.steps, vec!["analyst", "review"]);
        assert_eq!(wf.agent_for("review"), Some("echo"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_agent() {
        let mut config: RuntimeConfig = toml::from_str(FULL).unwrap();
        config.agents.retain(|a| a.id != "echo");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownAgent { ref agent_id, .. }) if agent_id == "echo"
        ));
    }

    #[test]
    fn test_validate_rejects_broker_without_url() {
        let mut config: RuntimeConfig = toml::from_str(FULL).unwrap();
        config.bus.url = None;
        assert!(matches!(config.validate(), Err(ConfigError::MissingBusUrl)));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = RuntimeConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        let mut config: RuntimeConfig = toml::from_str(FULL).unwrap();
        config.workflows[0].steps.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Definition(DefinitionError::NoSteps(_)))
        ));

        let mut config: RuntimeConfig = toml::from_str(FULL).unwrap();
        let dup = config.workflows[0].clone();
        config.workflows.push(dup);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateWorkflow(_))));
    }

    #[test]
    fn test_validate_rejects_http_agent_without_url() {
        let mut config: RuntimeConfig = toml::from_str(FULL).unwrap();
        config.agents[0].url = None;
        assert!(matches!(config.validate(), Err(ConfigError::MissingAgentUrl(_))));
    }
}
