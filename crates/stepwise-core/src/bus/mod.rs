//! Message bus port for workflow lifecycle events and task/result envelopes.
//!
//! - `MessageBus`: RPITIT trait implemented by every transport
//! - `BoxMessageBus`: object-safe wrapper so the transport is picked at runtime
//! - `InMemoryMessageBus`: in-process adapter on `tokio::sync::broadcast`
//! - `TopicPattern`: `*` wildcard matching for subscriptions
//!
//! Publishing is best-effort: adapters log and drop failures instead of
//! returning them, so a lost event never fails a workflow step.

pub mod box_bus;
pub mod memory;
pub mod pattern;

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use stepwise_types::message::BusMessage;
use thiserror::Error;
use uuid::Uuid;

pub use box_bus::BoxMessageBus;
pub use memory::InMemoryMessageBus;
pub use pattern::TopicPattern;

/// Async callback invoked for each matching result message.
pub type ResultHandler = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`ResultHandler`].
pub fn handler<F, Fut>(f: F) -> ResultHandler
where
    F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Handle returned by `subscribe_to_results`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of a bus health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusHealth {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BusHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            error: Some(error.into()),
        }
    }
}

/// Lifecycle and subscription errors. Publishing never returns these.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connection(String),

    #[error("bus is not connected")]
    NotConnected,

    #[error("invalid topic pattern '{0}'")]
    InvalidPattern(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),
}

/// Pub/sub transport contract shared by the in-process and network adapters.
pub trait MessageBus: Send + Sync {
    /// Adapter name for logs and health output (e.g. "memory", "broker").
    fn name(&self) -> &str;

    fn connect(&self) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Stop every subscription and refuse further publishes.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    fn health_check(&self) -> impl Future<Output = BusHealth> + Send;

    /// Fire-and-forget publish on the task channel.
    fn publish_task(&self, message: BusMessage) -> impl Future<Output = ()> + Send;

    /// Fire-and-forget publish on the result channel.
    fn publish_result(&self, message: BusMessage) -> impl Future<Output = ()> + Send;

    /// Invoke `handler` for every result whose `agent_id` matches `pattern`.
    ///
    /// Handlers run on their own task and never block publishers. Delivery is
    /// at-least-once, so handlers must be idempotent.
    fn subscribe_to_results(
        &self,
        pattern: &str,
        handler: ResultHandler,
    ) -> impl Future<Output = Result<SubscriptionId, BusError>> + Send;

    /// Stop one subscription. Returns false if the id is unknown.
    fn unsubscribe(&self, id: SubscriptionId) -> impl Future<Output = bool> + Send;
}
