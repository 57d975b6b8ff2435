//! Application state for CLI commands: the engine wired to the configured
//! checkpoint database, bus and agents.

use std::path::PathBuf;

use anyhow::Context;
use stepwise_infra::runtime::{Engine, build_runtime};
use stepwise_types::config::RuntimeConfig;

pub struct AppState {
    pub engine: Engine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Build the runtime. The engine is not initialized; read-only commands
    /// do not need agents or the bus.
    pub async fn init(config: &RuntimeConfig, data_dir: PathBuf) -> anyhow::Result<Self> {
        let engine = build_runtime(config, &data_dir)
            .await
            .context("failed to build runtime")?;
        Ok(Self { engine, data_dir })
    }
}
