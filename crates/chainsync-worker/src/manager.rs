//! Owns one [`ChainWorker`] per enabled network and restarts dead ones.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use chainsync_core::{Broker, ChainSyncConfig, NetworkConfig, NetworkError};

use crate::worker::{ChainHealth, ChainWorker, WorkerDeps, WorkerStatus};

pub struct WorkerManager {
    workers: Vec<Arc<ChainWorker>>,
    /// Every configured network, enabled or not.
    networks: Vec<NetworkConfig>,
    restart_delay: Duration,
    broker: Broker,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerManager {
    pub fn new(config: &ChainSyncConfig, deps: WorkerDeps) -> Self {
        let broker = deps.broker.clone();
        let workers = config
            .networks
            .iter()
            .filter(|network| network.enabled)
            .enumerate()
            .map(|(index, network)| ChainWorker::new(index, network.clone(), deps.clone()))
            .collect();
        Self {
            workers,
            networks: config.networks.clone(),
            restart_delay: config.worker_restart_delay(),
            broker,
            watchdog: Mutex::new(None),
        }
    }

    /// Start every worker concurrently, then arm the watchdog. A network
    /// that fails to come up is left `DEAD` for the watchdog.
    pub async fn start(&self) {
        info!(workers = self.workers.len(), "starting chain workers");
        join_all(self.workers.iter().map(|worker| worker.start())).await;

        let workers = self.workers.clone();
        let broker = self.broker.clone();
        let delay = self.restart_delay;
        let watchdog = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + delay, delay);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                restart_dead(&workers, &broker).await;
            }
        });
        if let Some(previous) = self.watchdog.lock().replace(watchdog) {
            previous.abort();
        }
    }

    /// One watchdog pass: restart `DEAD` workers and publish the health
    /// snapshot.
    pub async fn watchdog_tick(&self) {
        restart_dead(&self.workers, &self.broker).await;
    }

    /// Health of every worker, in registration order.
    pub fn status(&self) -> Vec<ChainHealth> {
        self.workers.iter().map(|worker| worker.status()).collect()
    }

    pub fn chain_health(&self, chain_id: u64) -> Result<ChainHealth, NetworkError> {
        if let Some(worker) = self.workers.iter().find(|w| w.chain_id() == chain_id) {
            return Ok(worker.status());
        }
        if self.networks.iter().any(|n| n.chain_id == chain_id) {
            Err(NetworkError::DisabledNetwork(chain_id))
        } else {
            Err(NetworkError::UnknownNetwork(chain_id))
        }
    }

    /// Stop the watchdog, then every worker.
    pub async fn destroy(&self) {
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        join_all(self.workers.iter().map(|worker| worker.stop())).await;
        info!("chain workers stopped");
    }
}

async fn restart_dead(workers: &[Arc<ChainWorker>], broker: &Broker) {
    let dead: Vec<_> = workers
        .iter()
        .filter(|worker| worker.status().worker_status == WorkerStatus::Dead)
        .collect();
    if !dead.is_empty() {
        info!(count = dead.len(), "restarting dead chain workers");
        join_all(dead.into_iter().map(|worker| worker.start())).await;
    }

    let health: Vec<ChainHealth> = workers.iter().map(|worker| worker.status()).collect();
    match serde_json::to_value(&health) {
        Ok(snapshot) => broker.notify_health(snapshot),
        Err(err) => warn!(error = %err, "failed to serialize health snapshot"),
    }
    debug!(workers = health.len(), "watchdog tick");
}
