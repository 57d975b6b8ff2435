//! Composition root: turns a validated `RuntimeConfig` into a ready-to-
//! initialize `WorkflowEngine` over SQLite, the configured bus and agents.

use std::path::Path;
use std::sync::Arc;

use stepwise_core::agent::AgentRegistry;
use stepwise_core::bus::{BoxMessageBus, BusError, InMemoryMessageBus};
use stepwise_core::circuit::CircuitBreaker;
use stepwise_core::workflow::{CheckpointError, EngineError, WorkflowEngine};
use stepwise_types::agent::AgentError;
use stepwise_types::config::{BusKind, ConfigError, RuntimeConfig};
use thiserror::Error;

use crate::agent::build_agent;
use crate::bus::BrokerMessageBus;
use crate::config::resolve_database_url;
use crate::sqlite::checkpoint::SqliteCheckpointStore;

/// The engine as wired for production.
pub type Engine = WorkflowEngine<SqliteCheckpointStore>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("checkpoint store: {0}")]
    Store(#[from] CheckpointError),

    #[error("message bus: {0}")]
    Bus(#[from] BusError),

    #[error("agent '{agent_id}': {source}")]
    Agent {
        agent_id: String,
        #[source]
        source: AgentError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Build every component named by `config`. The returned engine still needs
/// `initialize()` before it executes workflows.
pub async fn build_runtime(config: &RuntimeConfig, data_dir: &Path) -> Result<Engine, RuntimeError> {
    config.validate()?;

    if config.checkpoint_store.database_url.is_none() {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| CheckpointError::Storage(format!("create {}: {e}", data_dir.display())))?;
    }
    let database_url = resolve_database_url(config, data_dir);
    let store = SqliteCheckpointStore::connect(&database_url).await?;

    let bus = match config.bus.kind {
        BusKind::Memory => BoxMessageBus::new(InMemoryMessageBus::new(config.bus.capacity)),
        BusKind::Broker => BoxMessageBus::new(BrokerMessageBus::from_config(&config.bus)?),
    };

    let mut registry = AgentRegistry::new();
    for agent in &config.agents {
        let built = build_agent(agent).map_err(|source| RuntimeError::Agent {
            agent_id: agent.id.clone(),
            source,
        })?;
        registry.register_boxed(built);
    }

    let engine = WorkflowEngine::new(
        config.workflows.clone(),
        registry,
        CircuitBreaker::from_config(&config.circuit_breaker),
        Arc::new(store),
        bus,
    )?
    .with_step_timeout(config.engine.step_timeout());

    tracing::info!(
        database_url = %database_url,
        bus = engine.bus().name(),
        workflows = config.workflows.len(),
        agents = config.agents.len(),
        "runtime assembled"
    );
    Ok(engine)
}
