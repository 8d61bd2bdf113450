//! Error types for the supervisor and its collaborators.

use chainsync_core::TransportError;
use thiserror::Error;

/// Failure reported by a domain watcher.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("RPC error: {0}")]
    Rpc(#[from] TransportError),

    #[error("failed to apply logs for blocks {from}..={to}: {reason}")]
    Apply { from: u64, to: u64, reason: String },

    #[error("{0}")]
    Other(String),
}

/// Failure reported by the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Anything that ends a supervisor cycle.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),
}
