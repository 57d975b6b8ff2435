//! Remote agent reached over HTTP.
//!
//! `invoke` POSTs the workflow context as JSON and expects a JSON result.
//! Non-2xx responses are failures; 502/503/504 are reported as the agent
//! being unavailable so they read differently in logs and history.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use stepwise_core::agent::Agent;
use stepwise_types::agent::AgentError;
use stepwise_types::config::AgentConfig;

/// Per-request timeout when the config gives none.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Implements [`Agent`] by calling a remote HTTP endpoint.
///
/// The bearer token is held as a [`SecretString`] and only exposed when
/// building the request header. It never appears in Debug output.
pub struct HttpAgent {
    id: String,
    url: String,
    health_url: Option<String>,
    token: Option<SecretString>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpAgent {
    pub fn new(id: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            id: id.into(),
            url: url.into(),
            health_url: None,
            token: None,
            timeout,
            client,
        })
    }

    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    /// Build from an `[[agents]]` entry, reading the token from `token_env`.
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| AgentError::Unavailable(format!("agent '{}' has no url", config.id)))?;
        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let mut agent = Self::new(config.id.clone(), url, timeout)?;

        if let Some(var) = &config.token_env {
            let token = std::env::var(var).map_err(|_| {
                AgentError::Unavailable(format!(
                    "agent '{}': token variable {var} is not set",
                    config.id
                ))
            })?;
            agent = agent.with_token(SecretString::from(token));
        }
        if let Some(health_url) = &config.health_url {
            agent = agent.with_health_url(health_url.clone());
        }
        Ok(agent)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn classify(&self, err: reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::Timeout(self.timeout.as_millis() as u64)
        } else if err.is_connect() {
            AgentError::Unavailable(format!("{}: {err}", self.url))
        } else {
            AgentError::Failed(err.to_string())
        }
    }
}

impl Agent for HttpAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, input: Value) -> Result<Value, AgentError> {
        let mut request = self.client.post(&self.url).json(&input);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(agent_id = %self.id, status = %status, "agent returned error response");
            return Err(match status.as_u16() {
                502..=504 => AgentError::Unavailable(format!("HTTP {status}: {body}")),
                _ => AgentError::Failed(format!("HTTP {status}: {body}")),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))
    }

    async fn health_check(&self) -> bool {
        let Some(url) = &self.health_url else {
            return true;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(agent_id = %self.id, error = %e, "agent health check failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for HttpAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAgent")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("health_url", &self.health_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
