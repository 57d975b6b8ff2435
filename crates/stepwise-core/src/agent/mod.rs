//! Agent port for Stepwise.
//!
//! An agent is an opaque unit of work: it receives the accumulated workflow
//! context as JSON and returns a JSON result. The engine never inspects or
//! retries an agent's internal logic.
//!
//! - `Agent`: the RPITIT capability trait implemented by concrete agents
//! - `BoxAgent`: type-erased wrapper for runtime registration
//! - `AgentRegistry`: id -> agent lookup plus lifecycle and health fan-out

pub mod box_agent;
pub mod registry;

pub use box_agent::BoxAgent;
pub use registry::{AgentRegistry, RegistryError};

use std::future::Future;

use serde_json::Value;
use stepwise_types::agent::AgentError;

/// A pluggable step implementation.
///
/// Implementations live in stepwise-infra (e.g., `HttpAgent`) or in the
/// embedding application.
pub trait Agent: Send + Sync {
    /// Stable identifier the workflow definitions refer to.
    fn id(&self) -> &str;

    /// Run the step with the current workflow context as input.
    fn invoke(&self, input: Value) -> impl Future<Output = Result<Value, AgentError>> + Send;

    /// Whether the agent is currently able to serve calls.
    fn health_check(&self) -> impl Future<Output = bool> + Send {
        async { true }
    }

    /// Called once at runtime start.
    fn initialize(&self) -> impl Future<Output = Result<(), AgentError>> + Send {
        async { Ok(()) }
    }

    /// Called once at runtime stop.
    fn cleanup(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
