//! WebSocket JSON-RPC transport with head-of-line request queueing,
//! deduplicated subscriptions and a ping/pong liveness check.
//!
//! A background task owns the socket, the request queue, the retry timer and
//! the ping/pong timers. Callers talk to it through a command channel.
//! Requests go on the wire one at a time; the next one is sent only once the
//! previous one has been answered.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use chainsync_core::config::ChainSyncConfig;
use chainsync_core::error::TransportError;
use chainsync_core::metrics::Metrics;
use chainsync_core::policy::{RetryConfig, RetryPolicy};
use chainsync_core::request::{IncomingMessage, JsonRpcRequest, JsonRpcResponse};
use chainsync_core::transport::{
    ChainTransport, Connected, SubscriptionKind, TagSubscription, TransportConnector,
};

use crate::subscriptions::{Detached, Dispatch, Listener, SubscriptionId, SubscriptionRegistry};

/// Request ids are unique for the whole process and never reused.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Upper bound on the close handshake during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsClientConfig {
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// How long a ping may stay unanswered before the connection is dead.
    pub pong_max_wait: Duration,
    /// Retransmission budget and delay for the head request.
    pub retry: RetryConfig,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            pong_max_wait: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl From<&ChainSyncConfig> for WsClientConfig {
    fn from(config: &ChainSyncConfig) -> Self {
        Self {
            ping_interval: Duration::from_millis(config.rpc_ping_delay_ms),
            pong_max_wait: Duration::from_millis(config.rpc_pong_max_wait_ms),
            retry: RetryConfig {
                max_transmissions: config.rpc_max_retry_count,
                delay: Duration::from_millis(config.rpc_retry_delay_ms),
            },
        }
    }
}

type Reply = oneshot::Sender<Result<Value, TransportError>>;

/// A request waiting in the outbound queue.
struct PendingRequest {
    id: u64,
    payload: String,
    /// For `eth_subscribe`: the tag to open once the node answers.
    opens: Option<Opening>,
    reply: Reply,
}

/// A tag waiting for its upstream id, with the listener that asked for it.
struct Opening {
    tag: String,
    listener: Listener,
}

/// Command sent from callers to the background task.
enum Command {
    Request(PendingRequest),
    Destroy(oneshot::Sender<()>),
}

/// WebSocket JSON-RPC transport for one chain.
pub struct WsTransport {
    url: String,
    chain_id: u64,
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    /// Serialises subscribe/unsubscribe so a tag is opened at most once.
    subscription_gate: tokio::sync::Mutex<()>,
    destroyed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl WsTransport {
    /// Perform the WebSocket handshake with `url` and start the background task.
    pub async fn connect(
        url: impl Into<String>,
        chain_id: u64,
        config: WsClientConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Connected, TransportError> {
        let url = url.into();
        info!(chain_id, url = %url, "connecting via WebSocket");

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (sink, stream) = socket.split();

        Ok(Self::from_socket(url, chain_id, sink, stream, config, metrics))
    }

    /// Run the transport over an already established socket.
    pub fn from_socket<S, R>(
        url: impl Into<String>,
        chain_id: u64,
        sink: S,
        stream: R,
        config: WsClientConfig,
        metrics: Arc<Metrics>,
    ) -> Connected
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Display + Send,
        R: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal) = oneshot::channel();
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        metrics.chain_init(chain_id);

        let connection = Connection {
            chain_id,
            sink,
            stream,
            config,
            queue: VecDeque::new(),
            retry: RetryPolicy::new(config.retry),
            retry_at: None,
            pong_deadline: None,
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
            fatal: Some(fatal_tx),
        };
        tokio::spawn(connection.run(command_rx));

        let transport = Self {
            url: url.into(),
            chain_id,
            commands,
            registry,
            subscription_gate: tokio::sync::Mutex::new(()),
            destroyed: AtomicBool::new(false),
            metrics,
        };
        Connected {
            transport: Arc::new(transport),
            fatal,
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Vec<Value>,
        opens: Option<Opening>,
    ) -> Result<Value, TransportError> {
        let id = next_request_id();
        let payload = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request(PendingRequest {
                id,
                payload,
                opens,
                reply,
            }))
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl ChainTransport for WsTransport {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        self.send_request(method, params, None).await
    }

    async fn subscribe(&self, kind: SubscriptionKind) -> Result<TagSubscription, TransportError> {
        let tag = kind.tag();
        let _gate = self.subscription_gate.lock().await;

        let shared = self.registry.lock().attach(&tag);
        if let Some((listener_id, receiver)) = shared {
            debug!(chain_id = self.chain_id, tag = %tag, "joining existing subscription");
            return Ok(TagSubscription::new(tag, listener_id, receiver));
        }

        let (listener, receiver) = self.registry.lock().listener();
        let listener_id = listener.id;
        let opening = Opening {
            tag: tag.clone(),
            listener,
        };
        self.send_request("eth_subscribe", kind.params(), Some(opening))
            .await?;
        debug!(chain_id = self.chain_id, tag = %tag, "subscribed");
        Ok(TagSubscription::new(tag, listener_id, receiver))
    }

    async fn unsubscribe(&self, subscription: TagSubscription) -> Result<(), TransportError> {
        let _gate = self.subscription_gate.lock().await;

        let detached = self
            .registry
            .lock()
            .detach(subscription.tag(), subscription.listener_id());
        let Detached::Last(upstream) = detached else {
            return Ok(());
        };

        let remaining = self.registry.lock().len();
        self.metrics.set_subscriptions(self.chain_id, remaining);
        debug!(chain_id = self.chain_id, tag = subscription.tag(), "closing upstream subscription");

        let result = self
            .send_request("eth_unsubscribe", vec![Value::from(upstream.0.clone())], None)
            .await;
        self.registry.lock().forget(&upstream);
        result.map(|_| ())
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Destroy(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// How the background task ended.
enum Exit {
    Destroyed(Option<oneshot::Sender<()>>),
    Failed(TransportError),
}

/// Background task state. Everything here is dropped together on teardown.
struct Connection<S, R> {
    chain_id: u64,
    sink: S,
    stream: R,
    config: WsClientConfig,
    queue: VecDeque<PendingRequest>,
    retry: RetryPolicy,
    retry_at: Option<Instant>,
    pong_deadline: Option<Instant>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    metrics: Arc<Metrics>,
    fatal: Option<oneshot::Sender<TransportError>>,
}

impl<S, R> Connection<S, R>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let period = self.config.ping_interval;
        let mut ping = time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            let retry_at = self.retry_at;
            let pong_deadline = self.pong_deadline;

            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Request(request)) => self.enqueue(request).await,
                    Some(Command::Destroy(done)) => break Exit::Destroyed(Some(done)),
                    None => break Exit::Destroyed(None),
                },
                frame = self.stream.next() => self.on_frame(frame).await,
                _ = ping.tick() => self.on_ping().await,
                _ = time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.transmit_head().await
                }
                _ = time::sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    Err(TransportError::PongTimeout {
                        ms: self.config.pong_max_wait.as_millis() as u64,
                    })
                }
            };

            if let Err(err) = step {
                break Exit::Failed(err);
            }
        };

        self.shutdown().await;
        match exit {
            Exit::Destroyed(done) => {
                debug!(chain_id = self.chain_id, "transport destroyed");
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Exit::Failed(err) => {
                warn!(chain_id = self.chain_id, error = %err, "transport failed");
                if let Some(fatal) = self.fatal.take() {
                    let _ = fatal.send(err);
                }
            }
        }
    }

    async fn enqueue(&mut self, request: PendingRequest) -> Result<(), TransportError> {
        self.queue.push_back(request);
        self.metrics.set_queue_length(self.chain_id, self.queue.len());
        if self.queue.len() == 1 && self.retry_at.is_none() {
            self.transmit_head().await
        } else {
            Ok(())
        }
    }

    /// Put the head request on the wire, charging it to the retry budget.
    async fn transmit_head(&mut self) -> Result<(), TransportError> {
        let Some(head) = self.queue.front() else {
            return Ok(());
        };
        if !self.retry.try_transmit() {
            return Err(TransportError::RetryLimitExceeded {
                id: head.id,
                attempts: self.retry.transmissions(),
            });
        }
        if self.retry.is_retry() {
            debug!(chain_id = self.chain_id, id = head.id, attempt = self.retry.transmissions(), "retransmitting");
            self.metrics.request_retried(self.chain_id);
        } else {
            self.metrics.request_sent(self.chain_id);
        }

        let frame = Message::Text(head.payload.clone().into());
        self.sink
            .send(frame)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    /// Retransmit the head after the retry delay, unless a retry is already due.
    fn schedule_retry(&mut self) {
        if !self.queue.is_empty() && self.retry_at.is_none() {
            self.retry_at = Some(Instant::now() + self.retry.delay());
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<Result<Message, WsError>>,
    ) -> Result<(), TransportError> {
        match frame {
            Some(Ok(Message::Text(text))) => self.on_text(text.as_str()).await,
            Some(Ok(Message::Pong(_))) => {
                self.pong_deadline = None;
                Ok(())
            }
            Some(Ok(Message::Binary(_))) => {
                warn!(chain_id = self.chain_id, "unexpected binary frame");
                self.schedule_retry();
                Ok(())
            }
            Some(Ok(Message::Close(frame))) => {
                info!(chain_id = self.chain_id, ?frame, "connection closed by node");
                Err(TransportError::Closed)
            }
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(TransportError::WebSocket(e.to_string())),
            None => Err(TransportError::Closed),
        }
    }

    async fn on_text(&mut self, text: &str) -> Result<(), TransportError> {
        match IncomingMessage::parse(text) {
            Ok(IncomingMessage::Response(response)) => self.on_response(response).await,
            Ok(IncomingMessage::Notification(note)) => {
                let upstream = SubscriptionId(note.subscription);
                let dispatched = self.registry.lock().dispatch(&upstream, note.result);
                match dispatched {
                    Dispatch::Delivered(0) => {
                        debug!(chain_id = self.chain_id, subscription = %upstream, "no live listener for push");
                    }
                    Dispatch::Delivered(_) => self.metrics.event_received(self.chain_id),
                    Dispatch::Closing => {
                        debug!(chain_id = self.chain_id, subscription = %upstream, "dropping push for closing subscription");
                    }
                    Dispatch::Unknown => {
                        warn!(chain_id = self.chain_id, subscription = %upstream, "push for unknown subscription");
                        self.schedule_retry();
                    }
                }
                Ok(())
            }
            Err(err) => {
                warn!(chain_id = self.chain_id, error = %err, "malformed frame");
                self.schedule_retry();
                Ok(())
            }
        }
    }

    async fn on_response(&mut self, response: JsonRpcResponse) -> Result<(), TransportError> {
        let head_id = self.queue.front().map(|head| head.id);
        if head_id.is_none() || response.id.as_number() != head_id {
            warn!(chain_id = self.chain_id, id = %response.id, head = ?head_id, "response does not match the head request");
            self.schedule_retry();
            return Ok(());
        }
        if response.error.as_ref().is_some_and(|e| e.is_rate_limited()) {
            debug!(chain_id = self.chain_id, id = %response.id, "rate limited by node");
            self.schedule_retry();
            return Ok(());
        }

        let Some(head) = self.queue.pop_front() else {
            return Ok(());
        };
        self.retry.reset();
        self.retry_at = None;
        self.metrics.set_queue_length(self.chain_id, self.queue.len());

        match response.into_result() {
            Ok(result) => {
                self.metrics.request_replied(self.chain_id);
                self.complete(head, result);
            }
            Err(err) => {
                self.metrics.request_failed(self.chain_id);
                debug!(chain_id = self.chain_id, id = head.id, error = %err, "request failed");
                let _ = head.reply.send(Err(TransportError::Rpc(err)));
            }
        }

        self.transmit_head().await
    }

    fn complete(&self, head: PendingRequest, result: Value) {
        let outcome = match head.opens {
            None => Ok(result),
            Some(Opening { tag, listener }) => match result.as_str().map(str::to_owned) {
                Some(upstream) => {
                    let mut registry = self.registry.lock();
                    registry.open(tag, SubscriptionId(upstream), listener);
                    self.metrics.set_subscriptions(self.chain_id, registry.len());
                    Ok(result)
                }
                None => Err(TransportError::Deserialization(format!(
                    "invalid subscription id: {result}"
                ))),
            },
        };
        let _ = head.reply.send(outcome);
    }

    async fn on_ping(&mut self) -> Result<(), TransportError> {
        if self.pong_deadline.is_some() {
            info!(chain_id = self.chain_id, "still waiting for pong");
            return Ok(());
        }
        self.pong_deadline = Some(Instant::now() + self.config.pong_max_wait);
        self.sink
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))
    }

    /// Close the socket and drop all queued work. Waiting callers observe
    /// [`TransportError::Closed`]; listeners observe end-of-stream.
    async fn shutdown(&mut self) {
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        let sink = &mut self.sink;
        let _ = time::timeout(CLOSE_TIMEOUT, async move {
            let _ = sink.send(close).await;
            let _ = sink.close().await;
        })
        .await;

        self.registry.lock().clear();
        self.queue.clear();
        self.retry_at = None;
        self.pong_deadline = None;
        self.metrics.set_subscriptions(self.chain_id, 0);
        self.metrics.set_queue_length(self.chain_id, 0);
    }
}

/// Opens [`WsTransport`]s with a fixed configuration.
#[derive(Clone)]
pub struct WsConnector {
    config: WsClientConfig,
    metrics: Arc<Metrics>,
}

impl WsConnector {
    pub fn new(config: WsClientConfig, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self, url: &str, chain_id: u64) -> Result<Connected, TransportError> {
        WsTransport::connect(url, chain_id, self.config, Arc::clone(&self.metrics)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_core::metrics::{
        EVENT_RECEIVED, QUEUE_LENGTH, REQUEST_REPLIED, REQUEST_RETRIED, REQUEST_SENT,
        SUBSCRIPTIONS,
    };
    use futures::channel::mpsc as duplex;
    use futures::FutureExt;
    use serde_json::json;

    const CHAIN: u64 = 1337;

    /// The node side of an in-memory socket.
    struct FakeNode {
        outgoing: duplex::UnboundedReceiver<Message>,
        incoming: duplex::UnboundedSender<Result<Message, WsError>>,
    }

    impl FakeNode {
        async fn next_frame(&mut self) -> Option<Message> {
            self.outgoing.next().await
        }

        /// Next JSON-RPC request, skipping control frames.
        async fn next_request(&mut self) -> Value {
            loop {
                match self.outgoing.next().await {
                    Some(Message::Text(text)) => return serde_json::from_str(text.as_str()).unwrap(),
                    Some(_) => continue,
                    None => panic!("transport closed the socket"),
                }
            }
        }

        fn nothing_sent(&mut self) -> bool {
            self.outgoing.next().now_or_never().is_none()
        }

        fn send(&self, message: Message) {
            self.incoming.unbounded_send(Ok(message)).unwrap();
        }

        fn send_text(&self, text: String) {
            self.send(Message::Text(text.into()));
        }

        fn reply(&self, id: &Value, result: Value) {
            self.send_text(json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string());
        }

        fn reply_error(&self, id: &Value, code: i64) {
            self.send_text(
                json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": "nope" } })
                    .to_string(),
            );
        }

        fn push(&self, subscription: &str, result: Value) {
            self.send_text(
                json!({
                    "jsonrpc": "2.0",
                    "method": "eth_subscription",
                    "params": { "subscription": subscription, "result": result },
                })
                .to_string(),
            );
        }
    }

    fn quiet_config() -> WsClientConfig {
        WsClientConfig {
            ping_interval: Duration::from_secs(3_600),
            pong_max_wait: Duration::from_secs(3_600),
            retry: RetryConfig {
                max_transmissions: 5,
                delay: Duration::from_millis(100),
            },
        }
    }

    fn open(
        config: WsClientConfig,
    ) -> (
        Arc<dyn ChainTransport>,
        oneshot::Receiver<TransportError>,
        FakeNode,
        Arc<Metrics>,
    ) {
        let (client_tx, outgoing) = duplex::unbounded();
        let (incoming, client_rx) = duplex::unbounded();
        let metrics = Arc::new(Metrics::new());
        let Connected { transport, fatal } = WsTransport::from_socket(
            "ws://node.test",
            CHAIN,
            client_tx,
            client_rx,
            config,
            Arc::clone(&metrics),
        );
        (transport, fatal, FakeNode { outgoing, incoming }, metrics)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn responses_follow_submission_order() {
        let (transport, _fatal, mut node, metrics) = open(quiet_config());
        let t = Arc::clone(&transport);
        let calls = tokio::spawn(async move {
            tokio::join!(
                t.request("eth_chainId", vec![]),
                t.request("eth_blockNumber", vec![]),
                t.request("net_version", vec![]),
            )
        });

        let first = node.next_request().await;
        assert_eq!(first["method"], "eth_chainId");
        settle().await;
        assert!(node.nothing_sent(), "only the head request may be on the wire");
        assert_eq!(metrics.get(QUEUE_LENGTH, CHAIN), Some(3));

        node.reply(&first["id"], json!({ "chainId": 1337 }));
        let second = node.next_request().await;
        assert_eq!(second["method"], "eth_blockNumber");
        assert!(second["id"].as_u64() > first["id"].as_u64());

        node.reply(&second["id"], json!("0x10"));
        let third = node.next_request().await;
        node.reply(&third["id"], json!("1337"));

        let (a, b, c) = calls.await.unwrap();
        assert_eq!(a.unwrap(), json!({ "chainId": 1337 }));
        assert_eq!(b.unwrap(), json!("0x10"));
        assert_eq!(c.unwrap(), json!("1337"));
        assert_eq!(metrics.get(REQUEST_SENT, CHAIN), Some(3));
        assert_eq!(metrics.get(REQUEST_REPLIED, CHAIN), Some(3));
        assert_eq!(metrics.get(QUEUE_LENGTH, CHAIN), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_errors_reject_only_their_caller() {
        let (transport, mut fatal, mut node, _) = open(quiet_config());
        let t = Arc::clone(&transport);
        let call = tokio::spawn(async move { t.request("eth_call", vec![]).await });

        let req = node.next_request().await;
        node.reply_error(&req["id"], -32000);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Rpc(ref e) if e.code == -32000));
        assert!(fatal.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_head_is_sent_again_once() {
        let (transport, _fatal, mut node, metrics) = open(quiet_config());
        let t = Arc::clone(&transport);
        let call = tokio::spawn(async move { t.request("eth_blockNumber", vec![]).await });

        let first = node.next_request().await;
        let limited_at = Instant::now();
        node.reply_error(&first["id"], 429);

        let again = node.next_request().await;
        assert_eq!(again["id"], first["id"]);
        assert!(Instant::now() - limited_at >= Duration::from_millis(100));
        assert!(!call.is_finished());
        settle().await;
        assert!(node.nothing_sent());

        node.reply(&again["id"], json!("0x2a"));
        assert_eq!(call.await.unwrap().unwrap(), json!("0x2a"));
        assert_eq!(metrics.get(REQUEST_RETRIED, CHAIN), Some(1));
        assert_eq!(metrics.get(REQUEST_SENT, CHAIN), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_limit_is_fatal_once() {
        let mut config = quiet_config();
        config.retry.max_transmissions = 3;
        let (transport, fatal, mut node, _) = open(config);
        let t = Arc::clone(&transport);
        let call = tokio::spawn(async move { t.request("eth_getLogs", vec![]).await });

        for _ in 0..3 {
            let req = node.next_request().await;
            node.reply_error(&req["id"], 429);
        }

        let err = fatal.await.unwrap();
        assert!(matches!(err, TransportError::RetryLimitExceeded { attempts: 3, .. }));
        assert!(matches!(call.await.unwrap(), Err(TransportError::Closed)));

        let mut frames = Vec::new();
        while let Some(frame) = node.next_frame().await {
            frames.push(frame);
        }
        assert!(matches!(frames.as_slice(), [Message::Close(Some(_))]));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_retry_the_head() {
        let (transport, _fatal, mut node, _) = open(quiet_config());
        let t = Arc::clone(&transport);
        let call = tokio::spawn(async move { t.request("eth_chainId", vec![]).await });

        let first = node.next_request().await;
        node.send_text("{not json".into());
        let again = node.next_request().await;
        assert_eq!(again["id"], first["id"]);

        node.reply(&json!(u64::MAX), json!("0x1"));
        let third = node.next_request().await;
        assert_eq!(third["id"], first["id"]);

        node.reply(&third["id"], json!("0x539"));
        assert_eq!(call.await.unwrap().unwrap(), json!("0x539"));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_reports_chain_id() {
        let (transport, _fatal, mut node, _) = open(quiet_config());
        let t = Arc::clone(&transport);
        let ready = tokio::spawn(async move { t.ready().await });

        let req = node.next_request().await;
        assert_eq!(req["method"], "eth_chainId");
        node.reply(&req["id"], json!("0x539"));
        assert_eq!(ready.await.unwrap().unwrap(), 1337);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_are_deduplicated_by_tag() {
        let (transport, _fatal, mut node, metrics) = open(quiet_config());
        let t = Arc::clone(&transport);
        let first = tokio::spawn(async move { t.subscribe(SubscriptionKind::Block).await });

        let req = node.next_request().await;
        assert_eq!(req["method"], "eth_subscribe");
        assert_eq!(req["params"], json!(["newHeads"]));
        node.reply(&req["id"], json!("0xfeed"));

        let mut first = first.await.unwrap().unwrap();
        let mut second = transport.subscribe(SubscriptionKind::Block).await.unwrap();
        assert_eq!(first.tag(), "block");
        settle().await;
        assert!(node.nothing_sent(), "second listener must share the upstream subscription");
        assert_eq!(metrics.get(SUBSCRIPTIONS, CHAIN), Some(1));

        node.push("0xfeed", json!({ "number": "0x20" }));
        assert_eq!(first.recv().await.unwrap()["number"], "0x20");
        assert_eq!(second.recv().await.unwrap()["number"], "0x20");
        assert_eq!(metrics.get(EVENT_RECEIVED, CHAIN), Some(1));

        transport.unsubscribe(first).await.unwrap();
        settle().await;
        assert!(node.nothing_sent(), "a remaining listener keeps the upstream alive");

        let t = Arc::clone(&transport);
        let last = tokio::spawn(async move { t.unsubscribe(second).await });
        let req = node.next_request().await;
        assert_eq!(req["method"], "eth_unsubscribe");
        assert_eq!(req["params"], json!(["0xfeed"]));
        node.reply(&req["id"], json!(true));
        last.await.unwrap().unwrap();

        settle().await;
        assert!(node.nothing_sent());
        assert_eq!(metrics.get(SUBSCRIPTIONS, CHAIN), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn push_right_after_subscribe_reply_reaches_first_listener() {
        let (transport, _fatal, mut node, metrics) = open(quiet_config());
        let t = Arc::clone(&transport);
        let subscribing = tokio::spawn(async move { t.subscribe(SubscriptionKind::Block).await });

        let req = node.next_request().await;
        node.reply(&req["id"], json!("0xfeed"));
        node.push("0xfeed", json!({ "number": "0x30" }));
        settle().await;

        let mut subscription = subscribing.await.unwrap().unwrap();
        assert_eq!(subscription.recv().await.unwrap()["number"], "0x30");
        assert_eq!(metrics.get(EVENT_RECEIVED, CHAIN), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn push_without_live_listener_is_not_counted() {
        let (transport, _fatal, mut node, metrics) = open(quiet_config());
        let t = Arc::clone(&transport);
        let subscribing = tokio::spawn(async move { t.subscribe(SubscriptionKind::Block).await });

        let req = node.next_request().await;
        node.reply(&req["id"], json!("0xfeed"));
        drop(subscribing.await.unwrap().unwrap());

        node.push("0xfeed", json!({ "number": "0x31" }));
        settle().await;
        assert_eq!(metrics.get(EVENT_RECEIVED, CHAIN), Some(0));
        assert!(node.nothing_sent(), "a push for a known id is not retried");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_is_fatal() {
        let config = WsClientConfig {
            ping_interval: Duration::from_millis(100),
            pong_max_wait: Duration::from_millis(300),
            ..quiet_config()
        };
        let (_transport, fatal, mut node, _) = open(config);
        let started = Instant::now();

        let err = fatal.await.unwrap();
        assert!(matches!(err, TransportError::PongTimeout { ms: 300 }));
        assert!(Instant::now() - started >= Duration::from_millis(400));

        let mut pings = 0;
        while let Some(frame) = node.next_frame().await {
            if matches!(frame, Message::Ping(_)) {
                pings += 1;
            }
        }
        assert_eq!(pings, 1, "no new ping while a pong is outstanding");
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_the_connection() {
        let config = WsClientConfig {
            ping_interval: Duration::from_millis(100),
            pong_max_wait: Duration::from_millis(300),
            ..quiet_config()
        };
        let (_transport, mut fatal, mut node, _) = open(config);

        for _ in 0..5 {
            loop {
                match node.next_frame().await {
                    Some(Message::Ping(_)) => break,
                    Some(_) => continue,
                    None => panic!("transport closed the socket"),
                }
            }
            node.send(Message::Pong(Default::default()));
        }
        settle().await;
        assert!(matches!(
            fatal.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_closes_without_fatal_signal() {
        let (transport, fatal, mut node, _) = open(quiet_config());
        let t = Arc::clone(&transport);
        let pending = tokio::spawn(async move { t.request("eth_blockNumber", vec![]).await });
        node.next_request().await;

        transport.destroy().await;
        transport.destroy().await;

        match node.next_frame().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(node.next_frame().await.is_none());
        assert!(matches!(pending.await.unwrap(), Err(TransportError::Closed)));
        assert!(fatal.await.is_err(), "destroy never raises the fatal signal");
        assert!(matches!(
            transport.request("eth_chainId", vec![]).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn node_close_is_fatal() {
        let (_transport, fatal, node, _) = open(quiet_config());
        node.send(Message::Close(None));
        assert!(matches!(fatal.await.unwrap(), TransportError::Closed));
    }

    #[test]
    fn config_from_chainsync_config() {
        let mut config = ChainSyncConfig::with_networks(vec![]);
        config.rpc_max_retry_count = 4;
        config.rpc_retry_delay_ms = 250;
        let ws = WsClientConfig::from(&config);
        assert_eq!(ws.retry.max_transmissions, 4);
        assert_eq!(ws.retry.delay, Duration::from_millis(250));
        assert_eq!(ws.ping_interval, Duration::from_secs(15));
        assert_eq!(ws.pong_max_wait, Duration::from_secs(30));
    }
}
