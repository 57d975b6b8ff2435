//! BoxAgent -- object-safe dynamic dispatch wrapper for Agent.
//!
//! 1. `AgentDyn` is the object-safe mirror of `Agent` with boxed futures
//! 2. Blanket-impl `AgentDyn` for all `T: Agent`
//! 3. `BoxAgent` wraps `Box<dyn AgentDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use stepwise_types::agent::AgentError;

use super::Agent;

/// Object-safe version of [`Agent`] with boxed futures.
pub trait AgentDyn: Send + Sync {
    fn id(&self) -> &str;

    fn invoke_boxed(
        &self,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, AgentError>> + Send + '_>>;

    fn health_check_boxed(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    fn initialize_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + '_>>;

    fn cleanup_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

impl<T: Agent> AgentDyn for T {
    fn id(&self) -> &str {
        Agent::id(self)
    }

    fn invoke_boxed(
        &self,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, AgentError>> + Send + '_>> {
        Box::pin(self.invoke(input))
    }

    fn health_check_boxed(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(self.health_check())
    }

    fn initialize_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + '_>> {
        Box::pin(self.initialize())
    }

    fn cleanup_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.cleanup())
    }
}

/// Type-erased agent for runtime registration.
///
/// `Agent` uses RPITIT and cannot be a trait object directly; `BoxAgent`
/// exposes the same operations through `AgentDyn`.
pub struct BoxAgent {
    inner: Box<dyn AgentDyn>,
}

impl BoxAgent {
    pub fn new<T: Agent + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub async fn invoke(&self, input: Value) -> Result<Value, AgentError> {
        self.inner.invoke_boxed(input).await
    }

    pub async fn health_check(&self) -> bool {
        self.inner.health_check_boxed().await
    }

    pub async fn initialize(&self) -> Result<(), AgentError> {
        self.inner.initialize_boxed().await
    }

    pub async fn cleanup(&self) {
        self.inner.cleanup_boxed().await
    }
}

impl std::fmt::Debug for BoxAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgent").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    impl Agent for Upper {
        fn id(&self) -> &str {
            "upper"
        }

        async fn invoke(&self, input: Value) -> Result<Value, AgentError> {
            let text = input["text"]
                .as_str()
                .ok_or_else(|| AgentError::InvalidResponse("missing text".into()))?;
            Ok(json!({ "text": text.to_uppercase() }))
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn box_agent_delegates_to_inner() {
        let agent = BoxAgent::new(Upper);
        assert_eq!(agent.id(), "upper");

        let out = agent.invoke(json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, json!({"text": "HI"}));

        let err = agent.invoke(json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn box_agent_uses_overridden_and_default_hooks() {
        let agent = BoxAgent::new(Upper);
        assert!(!agent.health_check().await);
        assert!(agent.initialize().await.is_ok());
        agent.cleanup().await;
        assert!(format!("{agent:?}").contains("upper"));
    }
}
