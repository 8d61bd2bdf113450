//! Per-chain counters and gauges with a plain-text dump.
//!
//! One [`Metrics`] instance is built per process and shared as
//! `Arc<Metrics>` between the supervisors, their transports and the broker.
//! Chains are seeded lazily on first use and dumped in insertion order.

use std::fmt::Write as _;

use indexmap::IndexMap;
use parking_lot::Mutex;

/// Chain key used for the chain-agnostic broker subscription gauge.
pub const GLOBAL_CHAIN: u64 = 0;

pub const CONNECTED: &str = "connected";
pub const SUBSCRIPTIONS: &str = "subscriptions";
pub const QUEUE_LENGTH: &str = "queueLength";
pub const LAST_BLOCK: &str = "lastBlock";
pub const CONNECTION_FAILED: &str = "connectionFailed";
pub const DISCONNECTED: &str = "disconnected";
pub const REQUEST_SENT: &str = "requestSent";
pub const REQUEST_REPLIED: &str = "requestReplied";
pub const REQUEST_FAILED: &str = "requestFailed";
pub const REQUEST_RETRIED: &str = "requestRetried";
pub const EVENT_RECEIVED: &str = "eventReceived";
pub const WORKER_STARTED: &str = "workerStarted";
pub const WORKER_STOPPED: &str = "workerStopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Last write wins.
    Gauge,
    /// Monotonic until reset.
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

/// Every metric the registry knows about, in dump order.
const CATALOGUE: &[(&str, MetricKind)] = &[
    (CONNECTED, MetricKind::Gauge),
    (SUBSCRIPTIONS, MetricKind::Gauge),
    (QUEUE_LENGTH, MetricKind::Gauge),
    (LAST_BLOCK, MetricKind::Gauge),
    (CONNECTION_FAILED, MetricKind::Counter),
    (DISCONNECTED, MetricKind::Counter),
    (REQUEST_SENT, MetricKind::Counter),
    (REQUEST_REPLIED, MetricKind::Counter),
    (REQUEST_FAILED, MetricKind::Counter),
    (REQUEST_RETRIED, MetricKind::Counter),
    (EVENT_RECEIVED, MetricKind::Counter),
    (WORKER_STARTED, MetricKind::Counter),
    (WORKER_STOPPED, MetricKind::Counter),
];

#[derive(Debug)]
struct Series {
    kind: MetricKind,
    values: IndexMap<u64, u64>,
}

type Registry = IndexMap<&'static str, Series>;

/// Process-wide metrics registry.
#[derive(Debug)]
pub struct Metrics {
    inner: Mutex<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let metrics = Self {
            inner: Mutex::new(IndexMap::new()),
        };
        metrics.reset();
        metrics
    }

    /// Drop every recorded value and re-seed the broker subscription gauge.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = CATALOGUE
            .iter()
            .map(|&(name, kind)| {
                (
                    name,
                    Series {
                        kind,
                        values: IndexMap::new(),
                    },
                )
            })
            .collect();
        if let Some(series) = inner.get_mut(SUBSCRIPTIONS) {
            series.values.insert(GLOBAL_CHAIN, 0);
        }
    }

    /// Seed every metric with 0 for `chain_id` unless already present.
    pub fn chain_init(&self, chain_id: u64) {
        Self::seed(&mut self.inner.lock(), chain_id);
    }

    fn seed(inner: &mut Registry, chain_id: u64) {
        for series in inner.values_mut() {
            series.values.entry(chain_id).or_insert(0);
        }
    }

    fn set(&self, name: &'static str, chain_id: u64, value: u64) {
        let mut inner = self.inner.lock();
        Self::seed(&mut inner, chain_id);
        if let Some(series) = inner.get_mut(name) {
            series.values.insert(chain_id, value);
        }
    }

    fn incr(&self, name: &'static str, chain_id: u64) {
        let mut inner = self.inner.lock();
        Self::seed(&mut inner, chain_id);
        if let Some(slot) = inner
            .get_mut(name)
            .and_then(|series| series.values.get_mut(&chain_id))
        {
            *slot = slot.saturating_add(1);
        }
    }

    pub fn set_connected(&self, chain_id: u64, connected: bool) {
        self.set(CONNECTED, chain_id, u64::from(connected));
    }

    pub fn set_subscriptions(&self, chain_id: u64, count: usize) {
        self.set(SUBSCRIPTIONS, chain_id, count as u64);
    }

    /// Chain-agnostic subscription gauge; touches only the global slot.
    pub fn set_broker_subscriptions(&self, count: usize) {
        if let Some(series) = self.inner.lock().get_mut(SUBSCRIPTIONS) {
            series.values.insert(GLOBAL_CHAIN, count as u64);
        }
    }

    pub fn set_queue_length(&self, chain_id: u64, len: usize) {
        self.set(QUEUE_LENGTH, chain_id, len as u64);
    }

    pub fn set_last_block(&self, chain_id: u64, block: u64) {
        self.set(LAST_BLOCK, chain_id, block);
    }

    pub fn connection_failed(&self, chain_id: u64) {
        self.incr(CONNECTION_FAILED, chain_id);
    }

    pub fn disconnected(&self, chain_id: u64) {
        self.incr(DISCONNECTED, chain_id);
    }

    pub fn request_sent(&self, chain_id: u64) {
        self.incr(REQUEST_SENT, chain_id);
    }

    pub fn request_replied(&self, chain_id: u64) {
        self.incr(REQUEST_REPLIED, chain_id);
    }

    pub fn request_failed(&self, chain_id: u64) {
        self.incr(REQUEST_FAILED, chain_id);
    }

    pub fn request_retried(&self, chain_id: u64) {
        self.incr(REQUEST_RETRIED, chain_id);
    }

    pub fn event_received(&self, chain_id: u64) {
        self.incr(EVENT_RECEIVED, chain_id);
    }

    pub fn worker_started(&self, chain_id: u64) {
        self.incr(WORKER_STARTED, chain_id);
    }

    pub fn worker_stopped(&self, chain_id: u64) {
        self.incr(WORKER_STOPPED, chain_id);
    }

    /// Current value of one metric for one chain.
    pub fn get(&self, name: &str, chain_id: u64) -> Option<u64> {
        self.inner
            .lock()
            .get(name)
            .and_then(|series| series.values.get(&chain_id).copied())
    }

    /// Render the text exposition: a `# TYPE` line per non-empty metric,
    /// then one line per chain in insertion order.
    pub fn dump_metrics(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for (name, series) in inner.iter() {
            if series.values.is_empty() {
                continue;
            }
            let _ = writeln!(out, "# TYPE {name} {}", series.kind.as_str());
            for (chain_id, value) in &series.values {
                let _ = writeln!(out, "{name} {{chainId=\"{chain_id}\"}} {value}");
            }
        }
        out
    }
}
