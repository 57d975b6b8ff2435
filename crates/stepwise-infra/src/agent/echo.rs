use serde_json::{Value, json};
use stepwise_core::agent::Agent;
use stepwise_types::agent::AgentError;

/// Returns `{"agent": id, "echo": input}`.
#[derive(Debug, Clone)]
pub struct EchoAgent {
    id: String,
}

impl EchoAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Agent for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, input: Value) -> Result<Value, AgentError> {
        tracing::debug!(agent_id = %self.id, "echoing input");
        Ok(json!({ "agent": self.id, "echo": input }))
    }
}
