//! In-process message bus.
//!
//! Tasks go out on a `tokio::sync::broadcast` channel for raw consumers.
//! Results are fanned out by the publisher into one unbounded queue per
//! matching subscription, drained in order by that subscription's handler
//! task. Publishers never wait on handlers, and a slow handler only grows its
//! own queue: no result is skipped.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use stepwise_types::message::BusMessage;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BusError, BusHealth, MessageBus, ResultHandler, SubscriptionId, TopicPattern};

/// Default broadcast capacity of the task channel.
pub const DEFAULT_CAPACITY: usize = 1024;

struct Subscription {
    pattern: TopicPattern,
    queue: mpsc::UnboundedSender<BusMessage>,
    token: CancellationToken,
}

pub struct InMemoryMessageBus {
    tasks: broadcast::Sender<BusMessage>,
    connected: AtomicBool,
    /// Parent token for every subscription; replaced on reconnect.
    shutdown: Mutex<CancellationToken>,
    subscriptions: DashMap<SubscriptionId, Subscription>,
}

impl InMemoryMessageBus {
    /// Create a bus with the given task channel capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tasks, _) = broadcast::channel(capacity.max(1));
        Self {
            tasks,
            connected: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            subscriptions: DashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Raw receiver for the task channel (agents consuming work items).
    pub fn subscribe_tasks(&self) -> broadcast::Receiver<BusMessage> {
        self.tasks.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn shutdown_token(&self) -> CancellationToken {
        match self.shutdown.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn drop_disconnected(&self, kind: &str, message: &BusMessage) -> bool {
        if self.is_connected() {
            return false;
        }
        warn!(
            channel = kind,
            task_id = %message.task_id,
            event_type = %message.event_type(),
            "bus disconnected, dropping message"
        );
        true
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageBus for InMemoryMessageBus {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<(), BusError> {
        let mut token = match self.shutdown.lock() {
            Ok(token) => token,
            Err(poisoned) => poisoned.into_inner(),
        };
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        self.connected.store(true, Ordering::Release);
        debug!("in-memory bus connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.shutdown_token().cancel();
        self.subscriptions.clear();
        debug!("in-memory bus disconnected");
    }

    async fn health_check(&self) -> BusHealth {
        if self.is_connected() {
            BusHealth::healthy()
        } else {
            BusHealth::unhealthy("in-memory bus is not connected")
        }
    }

    async fn publish_task(&self, message: BusMessage) {
        if self.drop_disconnected("tasks", &message) {
            return;
        }
        let task_id = message.task_id.clone();
        match self.tasks.send(message) {
            Ok(receivers) => debug!(channel = "tasks", task_id = %task_id, receivers, "message published"),
            Err(_) => debug!(channel = "tasks", task_id = %task_id, "no subscribers, message dropped"),
        }
    }

    async fn publish_result(&self, message: BusMessage) {
        if self.drop_disconnected("results", &message) {
            return;
        }
        let mut delivered = 0usize;
        for subscription in self.subscriptions.iter() {
            if subscription.pattern.matches(&message.agent_id)
                && subscription.queue.send(message.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        debug!(channel = "results", task_id = %message.task_id, delivered, "message published");
    }

    async fn subscribe_to_results(
        &self,
        pattern: &str,
        handler: ResultHandler,
    ) -> Result<SubscriptionId, BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let pattern = TopicPattern::parse(pattern)?;
        let id = SubscriptionId::new();
        let token = self.shutdown_token().child_token();
        let (queue, mut rx) = mpsc::unbounded_channel();

        debug!(subscription = %id, pattern = %pattern, "result subscription started");
        self.subscriptions.insert(
            id,
            Subscription {
                pattern,
                queue,
                token: token.clone(),
            },
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(message) => handler(message).await,
                        None => break,
                    },
                }
            }
            debug!(subscription = %id, "result subscription stopped");
        });

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some((_, subscription)) => {
                subscription.token.cancel();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for InMemoryMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMessageBus")
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscriptions.len())
            .field("task_receivers", &self.tasks.receiver_count())
            .finish()
    }
}
