//! Per-chain connection supervisor.
//!
//! A [`ChainWorker`] owns one transport at a time. It connects, waits for
//! readiness, binds a fresh domain watcher, then streams new blocks until the
//! transport reports a fatal error. Every failure, whether during the
//! handshake or later, goes through the same teardown and leaves the worker
//! `DEAD` for the manager's watchdog to restart.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chainsync_core::{
    Broker, BrokerSubscription, ChainSyncConfig, ChainTransport, Connected, Metrics,
    NetworkConfig, SubscriptionKind, TagSubscription, TransportConnector, TransportError,
};

use crate::backfill::{self, header_number, BlockRange};
use crate::error::WorkerError;
use crate::watcher::{DomainWatcher, EventStore, WatcherFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    Starting,
    Connecting,
    Connected,
    Disconnected,
    Dead,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

/// `Crashed` only lasts while a failure teardown is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Waiting,
    Started,
    Crashed,
    Dead,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Started => "STARTED",
            Self::Crashed => "CRASHED",
            Self::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

/// Health snapshot of one configured network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHealth {
    pub index: usize,
    pub chain_id: u64,
    pub rpc_url: String,
    pub directory_address: String,
    pub provider_status: ProviderStatus,
    pub worker_status: WorkerStatus,
    pub restart_count: u64,
    pub last_known_block: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Bound on the handshake and on the readiness check, each.
    pub connect_timeout: Duration,
    /// Blocks per `eth_getLogs` call when replaying a range.
    pub backfill_batch_size: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            backfill_batch_size: 2_000,
        }
    }
}

impl From<&ChainSyncConfig> for WorkerSettings {
    fn from(config: &ChainSyncConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            backfill_batch_size: config.backfill_batch_size,
        }
    }
}

/// Everything a worker borrows from the process.
#[derive(Clone)]
pub struct WorkerDeps {
    pub connector: Arc<dyn TransportConnector>,
    pub watchers: Arc<dyn WatcherFactory>,
    pub store: Arc<dyn EventStore>,
    pub metrics: Arc<Metrics>,
    pub broker: Broker,
    pub settings: WorkerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Failure,
    Stop,
}

struct WorkerState {
    provider_status: ProviderStatus,
    worker_status: WorkerStatus,
    restart_count: u64,
    last_known_block: Option<u64>,
    transport: Option<Arc<dyn ChainTransport>>,
    watcher: Option<Arc<dyn DomainWatcher>>,
    /// The current cycle reached `CONNECTED`.
    connected_once: bool,
    /// A cycle started and has not been torn down yet.
    cycle_active: bool,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

pub struct ChainWorker {
    index: usize,
    network: NetworkConfig,
    deps: WorkerDeps,
    state: Mutex<WorkerState>,
    /// Serializes `start` and `stop`.
    lifecycle: tokio::sync::Mutex<()>,
}

impl ChainWorker {
    pub fn new(index: usize, network: NetworkConfig, deps: WorkerDeps) -> Arc<Self> {
        deps.metrics.chain_init(network.chain_id);
        Arc::new(Self {
            index,
            network,
            deps,
            state: Mutex::new(WorkerState {
                provider_status: ProviderStatus::Disconnected,
                worker_status: WorkerStatus::Waiting,
                restart_count: 0,
                last_known_block: None,
                transport: None,
                watcher: None,
                connected_once: false,
                cycle_active: false,
                stop: None,
                task: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.network.chain_id
    }

    pub fn status(&self) -> ChainHealth {
        let state = self.state.lock();
        ChainHealth {
            index: self.index,
            chain_id: self.network.chain_id,
            rpc_url: self.network.rpc_url.clone(),
            directory_address: self.network.directory_address.clone(),
            provider_status: state.provider_status,
            worker_status: state.worker_status,
            restart_count: state.restart_count,
            last_known_block: state.last_known_block,
        }
    }

    /// Run one connection cycle. A no-op unless the worker is idle
    /// (never started, stopped, or dead).
    ///
    /// Returns once the worker is either `CONNECTED` or torn down again.
    pub async fn start(self: &Arc<Self>) {
        let _guard = self.lifecycle.lock().await;
        {
            let mut state = self.state.lock();
            let provider_idle = matches!(
                state.provider_status,
                ProviderStatus::Disconnected | ProviderStatus::Dead
            );
            let worker_idle = matches!(state.worker_status, WorkerStatus::Waiting | WorkerStatus::Dead);
            if !provider_idle || !worker_idle || state.cycle_active {
                debug!(
                    chain_id = self.network.chain_id,
                    provider = %state.provider_status,
                    worker = %state.worker_status,
                    "worker already running, ignoring start"
                );
                return;
            }
            state.provider_status = ProviderStatus::Starting;
            state.worker_status = WorkerStatus::Waiting;
            state.cycle_active = true;
            state.connected_once = false;
        }

        info!(
            chain_id = self.network.chain_id,
            url = %self.network.rpc_url,
            "starting chain worker"
        );
        if let Err(err) = self.connect().await {
            warn!(chain_id = self.network.chain_id, error = %err, "chain worker failed to start");
            self.teardown(Teardown::Failure).await;
        }
    }

    /// Shut the worker down without counting a restart. It is left
    /// `DISCONNECTED`/`WAITING`, which the watchdog does not restart.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let (stop, task) = {
            let mut state = self.state.lock();
            (state.stop.take(), state.task.take())
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(chain_id = self.network.chain_id, error = %err, "worker task panicked");
            }
        }

        self.teardown(Teardown::Stop).await;

        let mut state = self.state.lock();
        state.provider_status = ProviderStatus::Disconnected;
        state.worker_status = WorkerStatus::Waiting;
        info!(chain_id = self.network.chain_id, "chain worker stopped");
    }

    async fn connect(self: &Arc<Self>) -> Result<(), WorkerError> {
        let chain_id = self.network.chain_id;
        let limit = self.deps.settings.connect_timeout;

        let Connected { transport, fatal } =
            bounded(limit, self.deps.connector.connect(&self.network.rpc_url, chain_id)).await?;
        {
            let mut state = self.state.lock();
            state.transport = Some(Arc::clone(&transport));
            state.provider_status = ProviderStatus::Connecting;
        }

        let actual = bounded(limit, transport.ready()).await?;
        if actual != chain_id {
            return Err(TransportError::ChainMismatch {
                expected: chain_id,
                actual,
            }
            .into());
        }

        let watcher = self.deps.watchers.create(chain_id, Arc::clone(&transport));
        {
            let mut state = self.state.lock();
            state.watcher = Some(Arc::clone(&watcher));
            state.provider_status = ProviderStatus::Connected;
            state.worker_status = WorkerStatus::Started;
            state.connected_once = true;
        }
        self.deps.metrics.set_connected(chain_id, true);
        self.deps.metrics.worker_started(chain_id);
        info!(chain_id, url = %transport.url(), "chain worker connected");

        watcher
            .register_directory(&self.network.directory_address)
            .await?;
        let blocks = transport.subscribe(SubscriptionKind::Block).await?;
        let balance_loads = self.deps.broker.subscribe_balance_loading(chain_id);

        let (stop_tx, stop_rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.stop = Some(stop_tx);
        state.task = Some(tokio::spawn(Arc::clone(self).run(
            fatal,
            blocks,
            balance_loads,
            stop_rx,
        )));
        Ok(())
    }

    async fn run(
        self: Arc<Self>,
        mut fatal: oneshot::Receiver<TransportError>,
        mut blocks: TagSubscription,
        mut balance_loads: BrokerSubscription,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut balance_open = true;
        let failure = loop {
            tokio::select! {
                _ = &mut stop => break None,
                err = &mut fatal => break Some(err.unwrap_or(TransportError::Closed)),
                header = blocks.recv() => match header {
                    Some(header) => tokio::select! {
                        _ = &mut stop => break None,
                        _ = self.on_block(header) => {}
                    },
                    None => break Some(TransportError::Closed),
                },
                request = balance_loads.recv(), if balance_open => match request {
                    Some(request) => tokio::select! {
                        _ = &mut stop => break None,
                        _ = self.load_balances(request) => {}
                    },
                    None => balance_open = false,
                },
            }
        };

        drop(blocks);
        balance_loads.cancel();
        drop(fatal);

        if let Some(err) = failure {
            warn!(chain_id = self.network.chain_id, error = %err, "transport failed");
            self.teardown(Teardown::Failure).await;
        }
    }

    async fn on_block(&self, header: Value) {
        let chain_id = self.network.chain_id;
        let Some(head) = header_number(&header) else {
            warn!(chain_id, "block push without a number");
            return;
        };
        let (transport, watcher, last_known) = {
            let state = self.state.lock();
            (state.transport.clone(), state.watcher.clone(), state.last_known_block)
        };
        let (Some(transport), Some(watcher)) = (transport, watcher) else {
            return;
        };

        let range = BlockRange::replay(last_known, head);
        match backfill::replay(
            &transport,
            watcher.as_ref(),
            range,
            self.deps.settings.backfill_batch_size,
        )
        .await
        {
            Ok(applied) => {
                let latest = last_known.map_or(head, |last| last.max(head));
                self.state.lock().last_known_block = Some(latest);
                self.deps.metrics.set_last_block(chain_id, latest);
                debug!(chain_id, from = range.from, to = range.to, applied, "blocks applied");
            }
            Err(err) => {
                warn!(
                    chain_id,
                    from = range.from,
                    to = range.to,
                    error = %err,
                    "block replay failed, will retry on next block"
                );
            }
        }
    }

    async fn load_balances(&self, request: Value) {
        let watcher = self.state.lock().watcher.clone();
        let Some(watcher) = watcher else {
            return;
        };
        if let Err(err) = watcher.load_balances(request).await {
            warn!(chain_id = self.network.chain_id, error = %err, "balance loading failed");
        }
    }

    /// Release everything the current cycle holds. Runs at most once per
    /// cycle.
    async fn teardown(&self, reason: Teardown) {
        let chain_id = self.network.chain_id;
        let (transport, watcher, connected_once) = {
            let mut state = self.state.lock();
            if !std::mem::take(&mut state.cycle_active) {
                return;
            }
            if reason == Teardown::Failure {
                state.worker_status = WorkerStatus::Crashed;
            }
            (state.transport.take(), state.watcher.take(), state.connected_once)
        };

        if let Some(transport) = &transport {
            transport.destroy().await;
        }
        if let Some(watcher) = &watcher {
            watcher.clear().await;
        }
        if let Err(err) = self.deps.store.delete_pending_and_failed_events(chain_id).await {
            warn!(chain_id, error = %err, "failed to delete uncommitted events");
        }
        drop(transport);
        drop(watcher);

        let metrics = &self.deps.metrics;
        match reason {
            Teardown::Failure => {
                let restarts = {
                    let mut state = self.state.lock();
                    state.restart_count += 1;
                    state.provider_status = ProviderStatus::Disconnected;
                    state.worker_status = WorkerStatus::Dead;
                    state.restart_count
                };
                if connected_once {
                    metrics.disconnected(chain_id);
                } else {
                    metrics.connection_failed(chain_id);
                }
                metrics.worker_stopped(chain_id);
                info!(chain_id, restarts, "chain worker dead");
            }
            Teardown::Stop if connected_once => {
                metrics.disconnected(chain_id);
                metrics.worker_stopped(chain_id);
            }
            Teardown::Stop => {}
        }
        metrics.set_connected(chain_id, false);
    }
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TransportError::Timeout {
            ms: limit.as_millis() as u64,
        })?
}
