//! WebSocket subscription bookkeeping.
//!
//! Local listeners are grouped by tag (see
//! [`SubscriptionKind::tag`](chainsync_core::SubscriptionKind::tag)); each
//! tag maps to exactly one upstream `eth_subscribe` id, shared by all of its
//! listeners.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

/// A unique subscription ID returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One upstream subscription and the listeners sharing it.
struct TagEntry {
    upstream: SubscriptionId,
    listeners: HashMap<u64, mpsc::UnboundedSender<Value>>,
}

/// Result of removing a listener.
#[derive(Debug, PartialEq, Eq)]
pub enum Detached {
    /// Other listeners still use the tag.
    Shared,
    /// That was the last listener; the upstream subscription should be closed.
    Last(SubscriptionId),
    /// The tag or listener was not registered.
    Unknown,
}

/// Result of routing a push.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Forwarded to this many listeners.
    Delivered(usize),
    /// The upstream id is being torn down; the push is dropped.
    Closing,
    /// Nobody ever asked for this id.
    Unknown,
}

/// A listener allocated before its tag has an upstream subscription.
pub struct Listener {
    pub id: u64,
    sender: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    tags: HashMap<String, TagEntry>,
    upstream: HashMap<SubscriptionId, String>,
    next_listener: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a listener id and its channel without attaching it.
    pub fn listener(&mut self) -> (Listener, mpsc::UnboundedReceiver<Value>) {
        self.next_listener += 1;
        let (sender, rx) = mpsc::unbounded_channel();
        let listener = Listener {
            id: self.next_listener,
            sender,
        };
        (listener, rx)
    }

    /// Record a freshly opened upstream subscription for `tag` together with
    /// its first listener, so no push can arrive between the two.
    pub fn open(&mut self, tag: String, upstream: SubscriptionId, first: Listener) {
        self.upstream.insert(upstream.clone(), tag.clone());
        self.tags.insert(
            tag,
            TagEntry {
                upstream,
                listeners: HashMap::from([(first.id, first.sender)]),
            },
        );
    }

    /// Add a listener to an existing tag. `None` if the tag has no upstream
    /// subscription yet.
    pub fn attach(&mut self, tag: &str) -> Option<(u64, mpsc::UnboundedReceiver<Value>)> {
        if !self.tags.contains_key(tag) {
            return None;
        }
        let (listener, rx) = self.listener();
        let entry = self.tags.get_mut(tag)?;
        entry.listeners.insert(listener.id, listener.sender);
        Some((listener.id, rx))
    }

    /// Remove a listener. When it was the last one the tag is dropped, but
    /// its upstream id keeps resolving until [`forget`](Self::forget) so that
    /// in-flight pushes are not mistaken for unknown ones.
    pub fn detach(&mut self, tag: &str, listener_id: u64) -> Detached {
        let Some(entry) = self.tags.get_mut(tag) else {
            return Detached::Unknown;
        };
        if entry.listeners.remove(&listener_id).is_none() {
            return Detached::Unknown;
        }
        if !entry.listeners.is_empty() {
            return Detached::Shared;
        }
        match self.tags.remove(tag) {
            Some(entry) => Detached::Last(entry.upstream),
            None => Detached::Unknown,
        }
    }

    /// Drop the mapping for an upstream id once `eth_unsubscribe` completed.
    pub fn forget(&mut self, upstream: &SubscriptionId) {
        self.upstream.remove(upstream);
    }

    /// Forward a push to every listener of its tag.
    pub fn dispatch(&self, upstream: &SubscriptionId, payload: Value) -> Dispatch {
        let Some(tag) = self.upstream.get(upstream) else {
            return Dispatch::Unknown;
        };
        let Some(entry) = self.tags.get(tag) else {
            return Dispatch::Closing;
        };
        let delivered = entry
            .listeners
            .values()
            .filter(|tx| tx.send(payload.clone()).is_ok())
            .count();
        Dispatch::Delivered(delivered)
    }

    /// Number of live upstream subscriptions.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Returns `true` if there are no active subscriptions.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Drop everything; listeners observe end-of-stream.
    pub fn clear(&mut self) {
        self.tags.clear();
        self.upstream.clear();
    }
}
