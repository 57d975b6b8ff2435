//! Runtime configuration loader for Stepwise.
//!
//! Reads `stepwise.toml` from the data directory (`~/.stepwise/` in
//! production) or from an explicit path, deserializes it into
//! [`RuntimeConfig`] and validates it before anything is built from it.

use std::path::{Path, PathBuf};

use stepwise_types::config::{ConfigError, RuntimeConfig};

use crate::sqlite::pool::default_database_url;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STEPWISE_DATA_DIR";

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "stepwise.toml";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `STEPWISE_DATA_DIR` environment variable
/// 2. `~/.stepwise`
/// 3. `.stepwise` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepwise");
    }

    PathBuf::from(".stepwise")
}

/// Load and validate the runtime configuration.
///
/// - `explicit = Some(path)`: the file must exist and parse.
/// - `explicit = None`: reads `{data_dir}/stepwise.toml`; a missing file
///   yields [`RuntimeConfig::default()`], a malformed one is an error.
pub async fn load_config(data_dir: &Path, explicit: Option<&Path>) -> Result<RuntimeConfig, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (data_dir.join(CONFIG_FILE), false),
    };

    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => {
            tracing::debug!(path = %path.display(), "no config file found, using defaults");
            return Ok(RuntimeConfig::default());
        }
        Err(err) => {
            return Err(ConfigError::Read {
                path: path.display().to_string(),
                reason: err.to_string(),
            });
        }
    };

    let config = parse_config(&content, &path.display().to_string())?;
    tracing::debug!(
        path = %path.display(),
        workflows = config.workflows.len(),
        agents = config.agents.len(),
        "config loaded"
    );
    Ok(config)
}

/// Parse and validate TOML content. `origin` names the source in errors.
pub fn parse_config(content: &str, origin: &str) -> Result<RuntimeConfig, ConfigError> {
    let config: RuntimeConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        path: origin.to_string(),
        reason: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// The checkpoint database URL: the configured one, else the data directory default.
pub fn resolve_database_url(config: &RuntimeConfig, data_dir: &Path) -> String {
    config
        .checkpoint_store
        .database_url
        .clone()
        .unwrap_or_else(|| default_database_url(data_dir))
}
