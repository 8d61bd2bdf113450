//! The `ChainTransport` trait, the seam between a chain supervisor and the
//! connection it drives.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;
use crate::request::parse_quantity;

/// Logical subscription kinds a supervisor can ask for.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionKind {
    /// New block headers (`newHeads`).
    Block,
    /// Pending transaction hashes (`newPendingTransactions`).
    Pending,
    /// Contract logs matching a filter object.
    Logs(Value),
}

impl SubscriptionKind {
    /// Deterministic key used to deduplicate upstream subscriptions.
    ///
    /// Two log filters that differ only in key order share a tag.
    pub fn tag(&self) -> String {
        match self {
            Self::Block => "block".into(),
            Self::Pending => "pending".into(),
            Self::Logs(filter) => {
                let mut canonical = String::new();
                write_canonical(filter, &mut canonical);
                let digest = Sha256::digest(canonical.as_bytes());
                format!("filter:{}", hex::encode(digest))
            }
        }
    }

    /// Parameters for the upstream `eth_subscribe` call.
    pub fn params(&self) -> Vec<Value> {
        match self {
            Self::Block => vec![Value::from("newHeads")],
            Self::Pending => vec![Value::from("newPendingTransactions")],
            Self::Logs(filter) => vec![Value::from("logs"), filter.clone()],
        }
    }
}

/// JSON with object keys sorted, recursively.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// One local listener on a (possibly shared) upstream subscription.
///
/// Dropping the handle without calling [`ChainTransport::unsubscribe`]
/// stops delivery but keeps the upstream subscription alive.
#[derive(Debug)]
pub struct TagSubscription {
    tag: String,
    listener_id: u64,
    receiver: mpsc::UnboundedReceiver<Value>,
}

impl TagSubscription {
    pub fn new(tag: String, listener_id: u64, receiver: mpsc::UnboundedReceiver<Value>) -> Self {
        Self {
            tag,
            listener_id,
            receiver,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    /// Next push payload. `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

/// The async trait every chain transport implements.
///
/// # Object Safety
/// The trait is object-safe and is stored as `Arc<dyn ChainTransport>`.
#[async_trait]
pub trait ChainTransport: Send + Sync + 'static {
    /// Send one JSON-RPC request and wait for its result.
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError>;

    /// Network detection. Resolves to the chain id reported by the node.
    async fn ready(&self) -> Result<u64, TransportError> {
        let raw = self.request("eth_chainId", vec![]).await?;
        raw.as_str()
            .and_then(parse_quantity)
            .ok_or_else(|| TransportError::Deserialization(format!("invalid chain id: {raw}")))
    }

    /// Attach a listener for `kind`, opening the upstream subscription if
    /// this is the first listener for its tag.
    async fn subscribe(&self, kind: SubscriptionKind) -> Result<TagSubscription, TransportError>;

    /// Detach a listener. The upstream subscription is closed once the last
    /// listener for the tag is gone.
    async fn unsubscribe(&self, subscription: TagSubscription) -> Result<(), TransportError>;

    /// Close the connection. Idempotent; never raises the fatal signal.
    async fn destroy(&self);

    /// The endpoint this transport talks to.
    fn url(&self) -> &str;
}

impl dyn ChainTransport {
    /// Convenience: call a method and deserialize the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError> {
        let result = self.request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// A freshly opened transport plus its one-shot fatal error signal.
pub struct Connected {
    pub transport: Arc<dyn ChainTransport>,
    /// Fires at most once, when the transport dies on its own.
    pub fatal: oneshot::Receiver<TransportError>,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("url", &self.transport.url())
            .finish_non_exhaustive()
    }
}

/// Builds transports. The supervisor owns one and calls it on every (re)start.
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str, chain_id: u64) -> Result<Connected, TransportError>;
}
