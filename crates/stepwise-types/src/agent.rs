//! Agent invocation error type.

use thiserror::Error;

/// Failures an agent may report from `invoke`.
///
/// The engine treats every variant as an opaque step failure; the distinction
/// only matters for logs and the error message attached to the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),

    #[error("agent unavailable: {0}")]
    Unavailable(String),

    #[error("invalid agent response: {0}")]
    InvalidResponse(String),

    #[error("agent timed out after {0}ms")]
    Timeout(u64),
}

impl AgentError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
