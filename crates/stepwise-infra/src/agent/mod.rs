//! Concrete `Agent` implementations.
//!
//! - `HttpAgent`: POSTs the step input to a remote service
//! - `EchoAgent`: returns its input, for smoke-testing definitions

pub mod echo;
pub mod http;

pub use echo::EchoAgent;
pub use http::HttpAgent;

use stepwise_core::agent::BoxAgent;
use stepwise_types::agent::AgentError;
use stepwise_types::config::{AgentConfig, AgentKind};

/// Build the agent described by one `[[agents]]` entry.
pub fn build_agent(config: &AgentConfig) -> Result<BoxAgent, AgentError> {
    match config.kind {
        AgentKind::Http => Ok(BoxAgent::new(HttpAgent::from_config(config)?)),
        AgentKind::Echo => Ok(BoxAgent::new(EchoAgent::new(config.id.clone()))),
    }
}
