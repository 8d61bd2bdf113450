//! Collaborator seams: the per-chain domain watcher and the event store.
//!
//! The supervisor never decodes contract events itself. It binds a watcher
//! to the directory contract, feeds it raw logs for every block range it
//! observes, and asks the store to forget half-applied work on teardown.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use chainsync_core::ChainTransport;

use crate::error::{StoreError, WatcherError};

/// Projects on-chain events of one chain into the local read model.
///
/// Implementations must treat [`apply_logs`](Self::apply_logs) as
/// idempotent: ranges are replayed after every reconnect.
#[async_trait]
pub trait DomainWatcher: Send + Sync {
    /// Bind the root registry contract; seeds the watched address set.
    async fn register_directory(&self, address: &str) -> Result<(), WatcherError>;

    /// Contract addresses whose logs should be fetched.
    fn watched_addresses(&self) -> Vec<String>;

    /// Apply the raw logs of blocks `from..=to`.
    async fn apply_logs(&self, from: u64, to: u64, logs: Vec<Value>) -> Result<(), WatcherError>;

    /// Handle a payload from the `Balance.<chainId>/load` channel.
    async fn load_balances(&self, request: Value) -> Result<(), WatcherError>;

    /// Drop all in-memory state. Called once per teardown.
    async fn clear(&self);
}

/// Builds a fresh watcher for every supervisor cycle.
pub trait WatcherFactory: Send + Sync {
    fn create(&self, chain_id: u64, transport: Arc<dyn ChainTransport>) -> Arc<dyn DomainWatcher>;
}

/// Persistence operations the supervisor needs.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Remove event records that were not committed, or failed, for a chain.
    async fn delete_pending_and_failed_events(&self, chain_id: u64) -> Result<(), StoreError>;
}
