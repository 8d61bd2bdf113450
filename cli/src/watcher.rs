//! Log-only domain watcher used by `chainsync run`.
//!
//! Contract decoding lives outside this workspace; this watcher only tracks
//! the directory address and reports what the supervisor hands it.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use chainsync_core::ChainTransport;
use chainsync_worker::{DomainWatcher, WatcherError, WatcherFactory};

pub struct LogWatcher {
    chain_id: u64,
    addresses: Mutex<Vec<String>>,
}

#[async_trait]
impl DomainWatcher for LogWatcher {
    async fn register_directory(&self, address: &str) -> Result<(), WatcherError> {
        info!(chain_id = self.chain_id, directory = address, "watching directory");
        let mut addresses = self.addresses.lock();
        if !addresses.iter().any(|a| a.eq_ignore_ascii_case(address)) {
            addresses.push(address.to_string());
        }
        Ok(())
    }

    fn watched_addresses(&self) -> Vec<String> {
        self.addresses.lock().clone()
    }

    async fn apply_logs(&self, from: u64, to: u64, logs: Vec<Value>) -> Result<(), WatcherError> {
        if logs.is_empty() {
            debug!(chain_id = self.chain_id, from, to, "no logs");
        } else {
            info!(chain_id = self.chain_id, from, to, logs = logs.len(), "logs received");
        }
        Ok(())
    }

    async fn load_balances(&self, request: Value) -> Result<(), WatcherError> {
        info!(chain_id = self.chain_id, %request, "balance loading requested");
        Ok(())
    }

    async fn clear(&self) {
        self.addresses.lock().clear();
    }
}

pub struct LogWatchers;

impl WatcherFactory for LogWatchers {
    fn create(&self, chain_id: u64, _transport: Arc<dyn ChainTransport>) -> Arc<dyn DomainWatcher> {
        Arc::new(LogWatcher {
            chain_id,
            addresses: Mutex::new(Vec::new()),
        })
    }
}
