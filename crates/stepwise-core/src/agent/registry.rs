//! Agent registry for runtime agent lookup.
//!
//! Maps stable agent ids to boxed agents. Populated at startup and read-only
//! once the engine is built.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::Agent;
use super::box_agent::BoxAgent;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("agent '{agent_id}' failed to initialize: {reason}")]
    Initialization { agent_id: String, reason: String },
}

/// Registry of available agents, indexed by id.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<BoxAgent>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register an agent under its own id.
    ///
    /// If an agent with this id already exists, it is replaced.
    pub fn register<A: Agent + 'static>(&mut self, agent: A) {
        self.register_boxed(BoxAgent::new(agent));
    }

    pub fn register_boxed(&mut self, agent: BoxAgent) {
        let id = agent.id().to_string();
        if self.agents.insert(id.clone(), Arc::new(agent)).is_some() {
            warn!(agent_id = %id, "replaced previously registered agent");
        }
    }

    /// Look up an agent by id.
    pub fn resolve(&self, agent_id: &str) -> Result<Arc<BoxAgent>, RegistryError> {
        self.agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// All registered ids, sorted.
    pub fn list_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Run every agent's `initialize` hook. Stops at the first failure.
    pub async fn initialize(&self) -> Result<(), RegistryError> {
        for id in self.list_ids() {
            let agent = &self.agents[id];
            agent
                .initialize()
                .await
                .map_err(|e| RegistryError::Initialization {
                    agent_id: id.to_string(),
                    reason: e.to_string(),
                })?;
            debug!(agent_id = id, "agent initialized");
        }
        info!(count = self.agents.len(), "agent registry initialized");
        Ok(())
    }

    /// Run every agent's `cleanup` hook.
    pub async fn cleanup(&self) {
        join_all(self.agents.values().map(|agent| agent.cleanup())).await;
        debug!(count = self.agents.len(), "agent registry cleaned up");
    }

    /// Health-check every agent concurrently.
    pub async fn get_all_agents_health(&self) -> BTreeMap<String, bool> {
        let checks = self.agents.iter().map(|(id, agent)| async move {
            (id.clone(), agent.health_check().await)
        });
        join_all(checks).await.into_iter().collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
