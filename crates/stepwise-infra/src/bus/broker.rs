//! Network message bus backed by an HTTP broker.
//!
//! Broker contract:
//! - `POST {url}/publish/{tasks|results}` with one JSON envelope
//! - `GET {url}/subscribe/results?pattern=..` answering `text/event-stream`,
//!   one envelope per `data:` line. Reconnects send `Last-Event-ID` when the
//!   broker tagged events with ids, so a broker that keeps a backlog can
//!   replay what was missed.
//! - `GET {url}/health` answering 2xx when healthy
//!
//! Publishes go onto a bounded queue drained by a single background worker,
//! so envelopes reach the broker in publish order and callers never wait on
//! the network. A full queue drops the message with a warning.
//!
//! A subscription whose event stream fails or ends reopens it with
//! exponential backoff until it is unsubscribed or the bus disconnects.

use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use stepwise_core::bus::{
    BusError, BusHealth, MessageBus, ResultHandler, SubscriptionId, TopicPattern,
};
use stepwise_types::config::BusConfig;
use stepwise_types::message::BusMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long `disconnect` waits for queued publishes to drain.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// First delay before reopening a lost event stream; doubles per failure.
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

type EventStream =
    Pin<Box<dyn Stream<Item = Result<Event, EventStreamError<reqwest::Error>>> + Send>>;

#[derive(Debug, Clone, Copy)]
enum Channel {
    Tasks,
    Results,
}

impl Channel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Results => "results",
        }
    }
}

struct Outbound {
    channel: Channel,
    message: BusMessage,
}

pub struct BrokerMessageBus {
    base_url: String,
    client: reqwest::Client,
    capacity: usize,
    request_timeout: Duration,
    connected: AtomicBool,
    queue: Mutex<Option<mpsc::Sender<Outbound>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Parent token for every subscription; replaced on reconnect.
    shutdown: Mutex<CancellationToken>,
    subscriptions: DashMap<SubscriptionId, CancellationToken>,
}

impl BrokerMessageBus {
    /// Create a bus for the broker at `base_url`. Nothing is contacted until
    /// `connect`.
    pub fn new(
        base_url: impl Into<String>,
        capacity: usize,
        request_timeout: Duration,
    ) -> Result<Self, BusError> {
        // No client-wide timeout: it would also cut long-lived event streams.
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| BusError::Connection(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            capacity: capacity.max(1),
            request_timeout,
            connected: AtomicBool::new(false),
            queue: Mutex::new(None),
            worker: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            subscriptions: DashMap::new(),
        })
    }

    pub fn from_config(config: &BusConfig) -> Result<Self, BusError> {
        let url = config
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| BusError::Connection("broker bus requires a url".to_string()))?;
        Self::new(url, config.capacity, config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
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

    fn sender(&self) -> Option<mpsc::Sender<Outbound>> {
        match self.queue.lock() {
            Ok(queue) => queue.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn check_health(&self) -> Result<(), String> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| format!("broker unreachable: {e}"))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("broker health returned HTTP {}", response.status()))
        }
    }

    fn enqueue(&self, channel: Channel, message: BusMessage) {
        let sender = match self.sender() {
            Some(sender) if self.is_connected() => sender,
            _ => {
                warn!(
                    channel = channel.as_str(),
                    task_id = %message.task_id,
                    event_type = %message.event_type(),
                    "bus disconnected, dropping message"
                );
                return;
            }
        };

        let task_id = message.task_id.clone();
        match sender.try_send(Outbound { channel, message }) {
            Ok(()) => debug!(channel = channel.as_str(), task_id = %task_id, "message queued"),
            Err(mpsc::error::TrySendError::Full(_)) => warn!(
                channel = channel.as_str(),
                task_id = %task_id,
                capacity = self.capacity,
                "publish queue full, dropping message"
            ),
            Err(mpsc::error::TrySendError::Closed(_)) => warn!(
                channel = channel.as_str(),
                task_id = %task_id,
                "publish worker stopped, dropping message"
            ),
        }
    }
}

/// Drain the publish queue in order until every sender is dropped.
async fn run_publisher(
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(Outbound { channel, message }) = rx.recv().await {
        let url = format!("{base_url}/publish/{}", channel.as_str());
        match client
            .post(&url)
            .timeout(request_timeout)
            .json(&message)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(channel = channel.as_str(), task_id = %message.task_id, "message published");
            }
            Ok(response) => warn!(
                channel = channel.as_str(),
                task_id = %message.task_id,
                status = %response.status(),
                "broker rejected message"
            ),
            Err(e) => warn!(
                channel = channel.as_str(),
                task_id = %message.task_id,
                error = %e,
                "failed to publish message"
            ),
        }
    }
    debug!("broker publish queue drained");
}

impl MessageBus for BrokerMessageBus {
    fn name(&self) -> &str {
        "broker"
    }

    async fn connect(&self) -> Result<(), BusError> {
        if self.is_connected() {
            return Ok(());
        }
        self.check_health().await.map_err(BusError::Connection)?;

        {
            let mut token = match self.shutdown.lock() {
                Ok(token) => token,
                Err(poisoned) => poisoned.into_inner(),
            };
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = tokio::spawn(run_publisher(
            self.client.clone(),
            self.base_url.clone(),
            self.request_timeout,
            rx,
        ));
        match self.queue.lock() {
            Ok(mut queue) => *queue = Some(tx),
            Err(poisoned) => *poisoned.into_inner() = Some(tx),
        }
        match self.worker.lock() {
            Ok(mut worker) => *worker = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }

        self.connected.store(true, Ordering::Release);
        debug!(url = %self.base_url, "broker bus connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.shutdown_token().cancel();
        self.subscriptions.clear();

        // Dropping the sender lets the worker finish what is already queued.
        match self.queue.lock() {
            Ok(mut queue) => drop(queue.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = worker {
            let abort = handle.abort_handle();
            if tokio::time::timeout(FLUSH_TIMEOUT, handle).await.is_err() {
                warn!(url = %self.base_url, "publish queue did not drain in time, aborting");
                abort.abort();
            }
        }
        debug!(url = %self.base_url, "broker bus disconnected");
    }

    async fn health_check(&self) -> BusHealth {
        if !self.is_connected() {
            return BusHealth::unhealthy("broker bus is not connected");
        }
        match self.check_health().await {
            Ok(()) => BusHealth::healthy(),
            Err(reason) => BusHealth::unhealthy(reason),
        }
    }

    async fn publish_task(&self, message: BusMessage) {
        self.enqueue(Channel::Tasks, message);
    }

    async fn publish_result(&self, message: BusMessage) {
        self.enqueue(Channel::Results, message);
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

        let mut source = ResultSource {
            client: self.client.clone(),
            url: format!("{}/subscribe/results", self.base_url),
            pattern,
            last_event_id: None,
        };
        let events = source.open().await?;

        let id = SubscriptionId::new();
        let token = self.shutdown_token().child_token();
        self.subscriptions.insert(id, token.clone());

        // The handler drains its own queue so a slow handler never stalls
        // reading the stream.
        let (queue, mut rx) = mpsc::unbounded_channel::<BusMessage>();
        let handler_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = handler_token.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(message) => handler(message).await,
                        None => break,
                    },
                }
            }
        });

        debug!(subscription = %id, pattern = %source.pattern, "broker subscription started");
        tokio::spawn(async move {
            source.run(id, events, queue, token).await;
            debug!(subscription = %id, "broker subscription stopped");
        });

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// One subscription's view of the broker's result stream.
struct ResultSource {
    client: reqwest::Client,
    url: String,
    pattern: TopicPattern,
    last_event_id: Option<String>,
}

impl ResultSource {
    async fn open(&self) -> Result<EventStream, BusError> {
        let mut request = self
            .client
            .get(&self.url)
            .query(&[("pattern", self.pattern.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(last) = &self.last_event_id {
            request = request.header("Last-Event-ID", last.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BusError::Subscribe(format!(
                "broker returned HTTP {}",
                response.status()
            )));
        }
        Ok(Box::pin(response.bytes_stream().eventsource()))
    }

    /// Forward matching envelopes to `queue`, reopening the stream whenever
    /// it fails or ends, until `token` is cancelled.
    async fn run(
        &mut self,
        id: SubscriptionId,
        mut events: EventStream,
        queue: mpsc::UnboundedSender<BusMessage>,
        token: CancellationToken,
    ) {
        loop {
            self.forward(id, &mut events, &queue, &token).await;
            if token.is_cancelled() {
                return;
            }

            let mut delay = RECONNECT_BASE_DELAY;
            events = loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.open().await {
                    Ok(events) => {
                        debug!(subscription = %id, "broker event stream reopened");
                        break events;
                    }
                    Err(e) => {
                        warn!(
                            subscription = %id,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "failed to reopen broker event stream"
                        );
                        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    }
                }
            };
        }
    }

    async fn forward(
        &mut self,
        id: SubscriptionId,
        events: &mut EventStream,
        queue: &mpsc::UnboundedSender<BusMessage>,
        token: &CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        if !event.id.is_empty() {
                            self.last_event_id = Some(event.id.clone());
                        }
                        if event.data.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<BusMessage>(&event.data) {
                            // The broker filters too; this keeps delivery
                            // identical to the in-process bus.
                            Ok(message) if self.pattern.matches(&message.agent_id) => {
                                if queue.send(message).is_err() {
                                    return;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!(subscription = %id, error = %e, "malformed broker event, skipping"),
                        }
                    }
                    Some(Err(e)) => {
                        warn!(subscription = %id, error = %e, "broker event stream failed, reconnecting");
                        return;
                    }
                    None => {
                        warn!(subscription = %id, "broker closed event stream, reconnecting");
                        return;
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for BrokerMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerMessageBus")
            .field("base_url", &self.base_url)
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::sse::{Event, Sse};
    use axum::routing::{get, post};
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::Arc;
    use stepwise_core::bus::{BoxMessageBus, handler};
    use stepwise_types::message::WorkflowEventKind;
    use tokio::sync::broadcast;
    use tokio_stream::wrappers::BroadcastStream;

    #[derive(Clone)]
    struct Broker {
        published: Arc<Mutex<Vec<(String, BusMessage)>>>,
        results: broadcast::Sender<String>,
        healthy: Arc<AtomicBool>,
        /// Cancelled to end every open event stream.
        streams: Arc<Mutex<CancellationToken>>,
        subscribes: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Broker {
        fn close_streams(&self) {
            let mut token = self.streams.lock().unwrap();
            token.cancel();
            *token = CancellationToken::new();
        }

        fn subscribe_count(&self) -> usize {
            self.subscribes.load(Ordering::SeqCst)
        }

        fn published(&self, channel: &str) -> Vec<BusMessage> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| c == channel)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    async fn publish(
        State(broker): State<Broker>,
        Path(channel): Path<String>,
        Json(message): Json<BusMessage>,
    ) -> StatusCode {
        if channel == "results" {
            let _ = broker.results.send(serde_json::to_string(&message).unwrap());
        }
        broker.published.lock().unwrap().push((channel, message));
        StatusCode::ACCEPTED
    }

    async fn subscribe(
        State(broker): State<Broker>,
    ) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
        let closed = broker.streams.lock().unwrap().clone();
        let stream = tokio_stream::StreamExt::filter_map(
            BroadcastStream::new(broker.results.subscribe()),
            |data| data.ok().map(|data| Ok(Event::default().data(data))),
        )
        .take_until(async move { closed.cancelled().await });
        broker.subscribes.fetch_add(1, Ordering::SeqCst);
        Sse::new(stream)
    }

    async fn health(State(broker): State<Broker>) -> StatusCode {
        if broker.healthy.load(Ordering::SeqCst) {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }

    async fn spawn_broker() -> (String, Broker) {
        let (results, _) = broadcast::channel(64);
        let broker = Broker {
            published: Arc::new(Mutex::new(Vec::new())),
            results,
            healthy: Arc::new(AtomicBool::new(true)),
            streams: Arc::new(Mutex::new(CancellationToken::new())),
            subscribes: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/publish/{channel}", post(publish))
            .route("/subscribe/results", get(subscribe))
            .route("/health", get(health))
            .with_state(broker.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), broker)
    }

    fn bus(url: &str) -> BrokerMessageBus {
        BrokerMessageBus::new(url, 16, Duration::from_secs(2)).unwrap()
    }

    fn lifecycle(workflow: &str, execution: &str) -> BusMessage {
        BusMessage::lifecycle(execution, workflow, WorkflowEventKind::WorkflowStarted, json!({}))
    }

    #[tokio::test]
    async fn connect_fails_without_broker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let bus = bus(&format!("http://{addr}"));
        assert!(matches!(bus.connect().await, Err(BusError::Connection(_))));
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn publishes_arrive_in_order() {
        let (url, broker) = spawn_broker().await;
        let bus = bus(&format!("{url}/"));
        assert_eq!(bus.base_url(), url);
        bus.connect().await.unwrap();

        for i in 0..10 {
            bus.publish_result(lifecycle("content", &format!("exec-{i}"))).await;
        }
        bus.publish_task(BusMessage::task("t-1", "writer", WorkflowEventKind::WorkflowStarted, json!({"k": 1})))
            .await;
        bus.disconnect().await;

        let results = broker.published("results");
        let ids: Vec<String> = results.iter().map(|m| m.task_id.clone()).collect();
        assert_eq!(ids, (0..10).map(|i| format!("exec-{i}")).collect::<Vec<_>>());

        let tasks = broker.published("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].agent_id, "writer");
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_dropped() {
        let (url, broker) = spawn_broker().await;
        let bus = bus(&url);
        bus.publish_result(lifecycle("content", "lost")).await;

        bus.connect().await.unwrap();
        bus.disconnect().await;
        bus.publish_result(lifecycle("content", "also-lost")).await;

        assert!(broker.published("results").is_empty());
    }

    #[tokio::test]
    async fn subscription_delivers_matching_results() {
        let (url, _broker) = spawn_broker().await;
        let bus = BoxMessageBus::new(bus(&url));
        bus.connect().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let id = bus
            .subscribe_to_results(
                "workflow:alpha*",
                handler(move |message| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message.task_id);
                    }
                }),
            )
            .await
            .unwrap();

        bus.publish_result(lifecycle("alpha", "a-1")).await;
        bus.publish_result(lifecycle("beta", "b-1")).await;
        bus.publish_result(lifecycle("alpha-2", "a-2")).await;

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("a-1"));
        assert_eq!(second.as_deref(), Some("a-2"));

        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn subscription_reconnects_after_stream_loss() {
        let (url, broker) = spawn_broker().await;
        let bus = bus(&url);
        bus.connect().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe_to_results(
            "workflow:*",
            handler(move |message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message.task_id);
                }
            }),
        )
        .await
        .unwrap();

        bus.publish_result(lifecycle("alpha", "before")).await;
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("before"));

        broker.close_streams();
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.subscribe_count() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription should reopen its event stream");
        assert_eq!(bus.subscription_count(), 1);

        bus.publish_result(lifecycle("alpha", "after")).await;
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(second.as_deref(), Some("after"));
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn subscribe_requires_connection_and_valid_pattern() {
        let (url, _broker) = spawn_broker().await;
        let bus = bus(&url);
        let noop = handler(|_| async {});

        assert!(matches!(
            bus.subscribe_to_results("workflow:*", noop.clone()).await,
            Err(BusError::NotConnected)
        ));

        bus.connect().await.unwrap();
        assert!(matches!(
            bus.subscribe_to_results("", noop).await,
            Err(BusError::InvalidPattern(_))
        ));
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn health_follows_broker_and_connection() {
        let (url, broker) = spawn_broker().await;
        let bus = bus(&url);
        assert!(!bus.health_check().await.healthy);

        bus.connect().await.unwrap();
        assert!(bus.health_check().await.healthy);

        broker.healthy.store(false, Ordering::SeqCst);
        let health = bus.health_check().await;
        assert!(!health.healthy);
        assert!(health.error.unwrap().contains("503"));

        broker.healthy.store(true, Ordering::SeqCst);
        bus.disconnect().await;
        assert!(!bus.health_check().await.healthy);
    }

    #[test]
    fn from_config_requires_url() {
        let config = BusConfig::default();
        assert!(matches!(
            BrokerMessageBus::from_config(&config),
            Err(BusError::Connection(_))
        ));
    }
}
