//! chainsync-worker: per-chain supervisors for ChainSync.
//!
//! [`ChainWorker`] drives one network through connect, readiness, block
//! streaming and teardown. [`WorkerManager`] owns one worker per enabled
//! network and restarts dead ones on a fixed interval.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example(config: chainsync_core::ChainSyncConfig, deps: chainsync_worker::WorkerDeps) {
//! use chainsync_worker::WorkerManager;
//!
//! let manager = WorkerManager::new(&config, deps);
//! manager.start().await;
//! for health in manager.status() {
//!     println!("{} {} {}", health.chain_id, health.provider_status, health.worker_status);
//! }
//! manager.destroy().await;
//! # }
//! ```

pub mod backfill;
pub mod error;
pub mod manager;
pub mod memory;
pub mod watcher;
pub mod worker;

#[cfg(test)]
mod testing;

pub use backfill::BlockRange;
pub use error::{StoreError, WatcherError, WorkerError};
pub use manager::WorkerManager;
pub use memory::{EventState, MemoryEventStore, StoredEvent};
pub use watcher::{DomainWatcher, EventStore, WatcherFactory};
pub use worker::{ChainHealth, ChainWorker, ProviderStatus, WorkerDeps, WorkerSettings, WorkerStatus};
