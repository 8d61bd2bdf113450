//! Scripted collaborators for supervisor and manager tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use chainsync_core::request::{to_quantity, JsonRpcError};
use chainsync_core::{
    ChainTransport, Connected, SubscriptionKind, TagSubscription, TransportConnector,
    TransportError,
};

use crate::error::WatcherError;
use crate::watcher::{DomainWatcher, WatcherFactory};

/// In-process stand-in for a node connection.
pub struct MockTransport {
    url: String,
    ready: Mutex<Option<Result<u64, TransportError>>>,
    pub destroy_calls: AtomicUsize,
    pub fail_get_logs: AtomicBool,
    pub requests: Mutex<Vec<(String, Vec<Value>)>>,
    blocks: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    fatal: Mutex<Option<oneshot::Sender<TransportError>>>,
}

impl MockTransport {
    /// Push a `newHeads` notification.
    pub fn push_block(&self, number: u64) {
        if let Some(tx) = self.blocks.lock().as_ref() {
            let _ = tx.send(json!({ "number": to_quantity(number) }));
        }
    }

    /// Raise the fatal signal.
    pub fn fail(&self, err: TransportError) {
        if let Some(tx) = self.fatal.lock().take() {
            let _ = tx.send(err);
        }
    }

    pub fn destroyed(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    /// `(fromBlock, toBlock)` of every `eth_getLogs` call.
    pub fn log_ranges(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .iter()
            .filter(|(method, _)| method == "eth_getLogs")
            .map(|(_, params)| {
                (
                    params[0]["fromBlock"].as_str().unwrap_or_default().to_string(),
                    params[0]["toBlock"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl ChainTransport for MockTransport {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        self.requests.lock().push((method.to_string(), params.clone()));
        match method {
            "eth_getLogs" if self.fail_get_logs.load(Ordering::SeqCst) => {
                Err(TransportError::Rpc(JsonRpcError {
                    code: -32005,
                    message: "query returned more than 10000 results".into(),
                    data: None,
                }))
            }
            "eth_getLogs" => Ok(json!([{ "blockNumber": params[0]["fromBlock"] }])),
            _ => Ok(Value::Null),
        }
    }

    async fn ready(&self) -> Result<u64, TransportError> {
        self.ready
            .lock()
            .take()
            .unwrap_or(Err(TransportError::Other("ready polled twice".into())))
    }

    async fn subscribe(&self, kind: SubscriptionKind) -> Result<TagSubscription, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.blocks.lock() = Some(tx);
        Ok(TagSubscription::new(kind.tag(), 1, rx))
    }

    async fn unsubscribe(&self, _subscription: TagSubscription) -> Result<(), TransportError> {
        Ok(())
    }

    async fn destroy(&self) {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.blocks.lock().take();
        self.fatal.lock().take();
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Hands out [`MockTransport`]s. Readiness outcomes can be scripted per
/// chain; unscripted connects become ready with the requested chain id.
#[derive(Default)]
pub struct MockConnector {
    scripts: Mutex<HashMap<u64, VecDeque<Result<u64, TransportError>>>>,
    refuse: Mutex<HashMap<u64, usize>>,
    pub transports: Mutex<Vec<(u64, Arc<MockTransport>)>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_ready(&self, chain_id: u64, outcome: Result<u64, TransportError>) {
        self.scripts.lock().entry(chain_id).or_default().push_back(outcome);
    }

    /// Fail the next `times` handshakes for a chain.
    pub fn refuse(&self, chain_id: u64, times: usize) {
        self.refuse.lock().insert(chain_id, times);
    }

    pub fn connects(&self, chain_id: u64) -> usize {
        self.transports
            .lock()
            .iter()
            .filter(|(id, _)| *id == chain_id)
            .count()
    }

    pub fn last(&self, chain_id: u64) -> Arc<MockTransport> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| *id == chain_id)
            .map(|(_, t)| Arc::clone(t))
            .expect("no transport opened for chain")
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, url: &str, chain_id: u64) -> Result<Connected, TransportError> {
        {
            let mut refuse = self.refuse.lock();
            if let Some(left) = refuse.get_mut(&chain_id).filter(|left| **left > 0) {
                *left -= 1;
                return Err(TransportError::WebSocket("connection refused".into()));
            }
        }

        let ready = self
            .scripts
            .lock()
            .get_mut(&chain_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(chain_id));
        let (fatal_tx, fatal) = oneshot::channel();
        let transport = Arc::new(MockTransport {
            url: url.to_string(),
            ready: Mutex::new(Some(ready)),
            destroy_calls: AtomicUsize::new(0),
            fail_get_logs: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            blocks: Mutex::new(None),
            fatal: Mutex::new(Some(fatal_tx)),
        });
        self.transports.lock().push((chain_id, Arc::clone(&transport)));
        Ok(Connected { transport, fatal })
    }
}

/// Watcher that records every call.
#[derive(Default)]
pub struct RecordingWatcher {
    pub directories: Mutex<Vec<String>>,
    pub applied: Mutex<Vec<(u64, u64, usize)>>,
    pub balance_loads: Mutex<Vec<Value>>,
    pub cleared: AtomicUsize,
}

#[async_trait]
impl DomainWatcher for RecordingWatcher {
    async fn register_directory(&self, address: &str) -> Result<(), WatcherError> {
        self.directories.lock().push(address.to_string());
        Ok(())
    }

    fn watched_addresses(&self) -> Vec<String> {
        self.directories.lock().clone()
    }

    async fn apply_logs(&self, from: u64, to: u64, logs: Vec<Value>) -> Result<(), WatcherError> {
        self.applied.lock().push((from, to, logs.len()));
        Ok(())
    }

    async fn load_balances(&self, request: Value) -> Result<(), WatcherError> {
        self.balance_loads.lock().push(request);
        Ok(())
    }

    async fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingFactory {
    pub created: Mutex<Vec<(u64, Arc<RecordingWatcher>)>>,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last(&self) -> Arc<RecordingWatcher> {
        self.created
            .lock()
            .last()
            .map(|(_, w)| Arc::clone(w))
            .expect("no watcher created")
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }
}

impl WatcherFactory for RecordingFactory {
    fn create(&self, chain_id: u64, _transport: Arc<dyn ChainTransport>) -> Arc<dyn DomainWatcher> {
        let watcher = Arc::new(RecordingWatcher::default());
        self.created.lock().push((chain_id, Arc::clone(&watcher)));
        watcher
    }
}

/// Let spawned tasks run until `done` holds.
pub async fn eventually(mut done: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
