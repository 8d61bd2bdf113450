//! In-process pub/sub broker keyed by channel name.
//!
//! Channel names:
//! ```text
//! <DataType>.<chainId>            type-wide updates
//! <DataType>.<chainId>.<address>  per-address updates
//! Balance.<chainId>/load          balance loading requests
//! Health                          periodic health snapshots
//! ```
//!
//! Channels are `tokio::sync::broadcast` senders created on first subscribe
//! and removed when their last subscriber cancels. Publishing to a channel
//! nobody listens on is a no-op.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::metrics::Metrics;

/// Channel carrying health snapshots.
pub const HEALTH_CHANNEL: &str = "Health";

/// Kinds of projected data that can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Balance,
    Token,
    Interface,
    Directory,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Balance => write!(f, "Balance"),
            Self::Token => write!(f, "Token"),
            Self::Interface => write!(f, "Interface"),
            Self::Directory => write!(f, "Directory"),
        }
    }
}

pub fn update_channel(data_type: DataType, chain_id: u64) -> String {
    format!("{data_type}.{chain_id}")
}

pub fn address_channel(data_type: DataType, chain_id: u64, address: &str) -> String {
    format!("{data_type}.{chain_id}.{address}")
}

pub fn balance_load_channel(chain_id: u64) -> String {
    format!("{}.{chain_id}/load", DataType::Balance)
}

struct BrokerInner {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
    capacity: usize,
    live: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl BrokerInner {
    fn publish(&self, channel: &str, data: Value) -> usize {
        let channels = self.channels.lock();
        match channels.get(channel) {
            // `send` only fails when every receiver is gone.
            Some(sender) => sender.send(data).unwrap_or(0),
            None => 0,
        }
    }

    fn release(&self, channel: &str) {
        let mut channels = self.channels.lock();
        if channels
            .get(channel)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.remove(channel);
            debug!(channel, "broker channel released");
        }
        drop(channels);
        let live = self.live.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics.set_broker_subscriptions(live);
    }
}

/// Process-wide broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("channels", &self.inner.channels.lock().len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl Broker {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                channels: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                live: AtomicUsize::new(0),
                metrics,
            }),
        }
    }

    /// Publish to the per-address channel and the type-wide channel.
    pub fn notify_update(&self, data_type: DataType, chain_id: u64, address: &str, data: Value) {
        self.inner
            .publish(&address_channel(data_type, chain_id, address), data.clone());
        self.inner.publish(&update_channel(data_type, chain_id), data);
    }

    pub fn notify_balance_loading_required(&self, chain_id: u64, data: Value) {
        self.inner.publish(&balance_load_channel(chain_id), data);
    }

    pub fn notify_health(&self, data: Value) {
        self.inner.publish(HEALTH_CHANNEL, data);
    }

    pub fn subscribe_updates(&self, data_type: DataType, chain_id: u64) -> BrokerSubscription {
        self.subscribe(update_channel(data_type, chain_id))
    }

    pub fn subscribe_updates_by_address(
        &self,
        data_type: DataType,
        chain_id: u64,
        address: &str,
    ) -> BrokerSubscription {
        self.subscribe(address_channel(data_type, chain_id, address))
    }

    pub fn subscribe_balance_loading(&self, chain_id: u64) -> BrokerSubscription {
        self.subscribe(balance_load_channel(chain_id))
    }

    pub fn subscribe_health(&self) -> BrokerSubscription {
        self.subscribe(HEALTH_CHANNEL.to_string())
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    fn subscribe(&self, channel: String) -> BrokerSubscription {
        let receiver = {
            let mut channels = self.inner.channels.lock();
            channels
                .entry(channel.clone())
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.metrics.set_broker_subscriptions(live);

        BrokerSubscription {
            stream: Some(receiver_stream(receiver, channel.clone())),
            channel,
            inner: Arc::clone(&self.inner),
        }
    }
}

fn receiver_stream(receiver: broadcast::Receiver<Value>, channel: String) -> BoxStream<'static, Value> {
    futures::stream::unfold((receiver, channel), |(mut receiver, channel)| async move {
        loop {
            match receiver.recv().await {
                Ok(value) => return Some((value, (receiver, channel))),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %channel, skipped, "broker subscriber lagged, skipping ahead");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// A cancellable, asynchronously iterable broker subscription.
///
/// Cancelling is idempotent and also happens on drop.
pub struct BrokerSubscription {
    channel: String,
    stream: Option<BoxStream<'static, Value>>,
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for BrokerSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSubscription")
            .field("channel", &self.channel)
            .field("active", &self.stream.is_some())
            .finish()
    }
}

impl BrokerSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_cancelled(&self) -> bool {
        self.stream.is_none()
    }

    /// Next published value. `None` once cancelled.
    pub async fn recv(&mut self) -> Option<Value> {
        self.stream.as_mut()?.next().await
    }

    pub fn cancel(&mut self) {
        if self.stream.take().is_some() {
            self.inner.release(&self.channel);
        }
    }
}

impl Stream for BrokerSubscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        match self.stream.as_mut() {
            Some(stream) => stream.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for BrokerSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{GLOBAL_CHAIN, SUBSCRIPTIONS};
    use serde_json::json;

    fn broker() -> (Broker, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        (Broker::new(16, Arc::clone(&metrics)), metrics)
    }

    #[tokio::test]
    async fn update_reaches_both_granularities() {
        let (broker, _) = broker();
        let mut wide = broker.subscribe_updates(DataType::Token, 1);
        let mut one = broker.subscribe_updates_by_address(DataType::Token, 1, "0xaa");
        let mut other = broker.subscribe_updates_by_address(DataType::Token, 1, "0xbb");

        broker.notify_update(DataType::Token, 1, "0xaa", json!({ "supply": 5 }));

        assert_eq!(wide.recv().await, Some(json!({ "supply": 5 })));
        assert_eq!(one.recv().await, Some(json!({ "supply": 5 })));
        other.cancel();
        assert_eq!(other.recv().await, None);
    }

    #[tokio::test]
    async fn balance_load_and_health_channels() {
        let (broker, _) = broker();
        let mut load = broker.subscribe_balance_loading(7);
        let mut health = broker.subscribe_health();
        assert_eq!(load.channel(), "Balance.7/load");

        broker.notify_balance_loading_required(7, json!(["0x01"]));
        broker.notify_health(json!([]));

        assert_eq!(load.recv().await, Some(json!(["0x01"])));
        assert_eq!(health.recv().await, Some(json!([])));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let (broker, _) = broker();
        broker.notify_health(json!({}));
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_releases_channel() {
        let (broker, metrics) = broker();
        let mut first = broker.subscribe_health();
        let second = broker.subscribe_health();
        assert_eq!(metrics.get(SUBSCRIPTIONS, GLOBAL_CHAIN), Some(2));

        first.cancel();
        first.cancel();
        assert!(first.is_cancelled());
        assert_eq!(broker.channel_count(), 1);
        assert_eq!(metrics.get(SUBSCRIPTIONS, GLOBAL_CHAIN), Some(1));

        drop(second);
        assert_eq!(broker.channel_count(), 0);
        assert_eq!(metrics.get(SUBSCRIPTIONS, GLOBAL_CHAIN), Some(0));
        drop(first);
        assert_eq!(metrics.get(SUBSCRIPTIONS, GLOBAL_CHAIN), Some(0));
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_ahead() {
        let metrics = Arc::new(Metrics::new());
        let broker = Broker::new(2, metrics);
        let mut health = broker.subscribe_health();
        for i in 0..5 {
            broker.notify_health(json!(i));
        }
        assert_eq!(health.recv().await, Some(json!(3)));
        assert_eq!(health.recv().await, Some(json!(4)));
    }

    #[tokio::test]
    async fn subscription_is_a_stream() {
        let (broker, _) = broker();
        let health = broker.subscribe_health();
        broker.notify_health(json!(1));
        broker.notify_health(json!(2));
        let got: Vec<Value> = health.take(2).collect().await;
        assert_eq!(got, vec![json!(1), json!(2)]);
    }
}
