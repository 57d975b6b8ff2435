//! BoxMessageBus -- object-safe dynamic dispatch wrapper for MessageBus.
//!
//! Same blanket-impl pattern as `BoxAgent`: `MessageBusDyn` mirrors the trait
//! with boxed futures and `BoxMessageBus` delegates to it.

use std::future::Future;
use std::pin::Pin;

use stepwise_types::message::BusMessage;

use super::{BusError, BusHealth, MessageBus, ResultHandler, SubscriptionId};

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`MessageBus`] with boxed futures.
pub trait MessageBusDyn: Send + Sync {
    fn name(&self) -> &str;
    fn connect_boxed(&self) -> BoxFut<'_, Result<(), BusError>>;
    fn disconnect_boxed(&self) -> BoxFut<'_, ()>;
    fn health_check_boxed(&self) -> BoxFut<'_, BusHealth>;
    fn publish_task_boxed(&self, message: BusMessage) -> BoxFut<'_, ()>;
    fn publish_result_boxed(&self, message: BusMessage) -> BoxFut<'_, ()>;
    fn subscribe_to_results_boxed<'a>(
        &'a self,
        pattern: &'a str,
        handler: ResultHandler,
    ) -> BoxFut<'a, Result<SubscriptionId, BusError>>;
    fn unsubscribe_boxed(&self, id: SubscriptionId) -> BoxFut<'_, bool>;
}

impl<T: MessageBus> MessageBusDyn for T {
    fn name(&self) -> &str {
        MessageBus::name(self)
    }

    fn connect_boxed(&self) -> BoxFut<'_, Result<(), BusError>> {
        Box::pin(self.connect())
    }

    fn disconnect_boxed(&self) -> BoxFut<'_, ()> {
        Box::pin(self.disconnect())
    }

    fn health_check_boxed(&self) -> BoxFut<'_, BusHealth> {
        Box::pin(self.health_check())
    }

    fn publish_task_boxed(&self, message: BusMessage) -> BoxFut<'_, ()> {
        Box::pin(self.publish_task(message))
    }

    fn publish_result_boxed(&self, message: BusMessage) -> BoxFut<'_, ()> {
        Box::pin(self.publish_result(message))
    }

    fn subscribe_to_results_boxed<'a>(
        &'a self,
        pattern: &'a str,
        handler: ResultHandler,
    ) -> BoxFut<'a, Result<SubscriptionId, BusError>> {
        Box::pin(self.subscribe_to_results(pattern, handler))
    }

    fn unsubscribe_boxed(&self, id: SubscriptionId) -> BoxFut<'_, bool> {
        Box::pin(self.unsubscribe(id))
    }
}

/// Type-erased message bus for runtime transport selection (memory vs broker).
pub struct BoxMessageBus {
    inner: Box<dyn MessageBusDyn>,
}

impl BoxMessageBus {
    pub fn new<T: MessageBus + 'static>(bus: T) -> Self {
        Self {
            inner: Box::new(bus),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn connect(&self) -> Result<(), BusError> {
        self.inner.connect_boxed().await
    }

    pub async fn disconnect(&self) {
        self.inner.disconnect_boxed().await
    }

    pub async fn health_check(&self) -> BusHealth {
        self.inner.health_check_boxed().await
    }

    pub async fn publish_task(&self, message: BusMessage) {
        self.inner.publish_task_boxed(message).await
    }

    pub async fn publish_result(&self, message: BusMessage) {
        self.inner.publish_result_boxed(message).await
    }

    pub async fn subscribe_to_results(
        &self,
        pattern: &str,
        handler: ResultHandler,
    ) -> Result<SubscriptionId, BusError> {
        self.inner.subscribe_to_results_boxed(pattern, handler).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe_boxed(id).await
    }
}

impl std::fmt::Debug for BoxMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxMessageBus")
            .field("name", &self.name())
            .finish()
    }
}
