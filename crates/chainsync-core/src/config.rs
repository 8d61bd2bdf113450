//! Process configuration: networks, transport tunables and logging.
//!
//! Loaded from YAML or JSON (chosen by file extension), then patched from
//! the environment:
//!
//! - `CHAINSYNC_RPC_URL_<chainId>` replaces that network's `rpc_url`
//! - `CHAINSYNC_LOG` replaces `log.level`

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const RPC_URL_ENV_PREFIX: &str = "CHAINSYNC_RPC_URL_";
pub const LOG_LEVEL_ENV: &str = "CHAINSYNC_LOG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One blockchain network to sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    /// `ws://` or `wss://` endpoint.
    pub rpc_url: String,
    /// Root registry contract the watcher starts from.
    pub directory_address: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
}

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: crate name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSyncConfig {
    pub networks: Vec<NetworkConfig>,
    /// Watchdog period of the worker manager.
    #[serde(default = "default_worker_restart_delay_ms")]
    pub worker_restart_delay_ms: u64,
    /// Accepted for compatibility; requests are always sent one at a time.
    #[serde(default = "default_rpc_max_parallel_requests")]
    pub rpc_max_parallel_requests: u32,
    /// Transmissions of one request before the transport gives up.
    #[serde(default = "default_rpc_max_retry_count")]
    pub rpc_max_retry_count: u32,
    #[serde(default = "default_rpc_ping_delay_ms")]
    pub rpc_ping_delay_ms: u64,
    #[serde(default = "default_rpc_pong_max_wait_ms")]
    pub rpc_pong_max_wait_ms: u64,
    #[serde(default = "default_rpc_retry_delay_ms")]
    pub rpc_retry_delay_ms: u64,
    /// Guard around the handshake and around readiness.
    #[serde(default = "default_rpc_connect_timeout_ms")]
    pub rpc_connect_timeout_ms: u64,
    /// Blocks per `eth_getLogs` call when replaying a range.
    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: u64,
    #[serde(default = "default_broker_channel_capacity")]
    pub broker_channel_capacity: usize,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_worker_restart_delay_ms() -> u64 { 10_000 }
fn default_rpc_max_parallel_requests() -> u32 { 1 }
fn default_rpc_max_retry_count() -> u32 { 10 }
fn default_rpc_ping_delay_ms() -> u64 { 15_000 }
fn default_rpc_pong_max_wait_ms() -> u64 { 30_000 }
fn default_rpc_retry_delay_ms() -> u64 { 1_000 }
fn default_rpc_connect_timeout_ms() -> u64 { 30_000 }
fn default_backfill_batch_size() -> u64 { 2_000 }
fn default_broker_channel_capacity() -> usize { 1_024 }
fn bool_true() -> bool { true }

impl ChainSyncConfig {
    /// Config with the given networks and every tunable at its default.
    pub fn with_networks(networks: Vec<NetworkConfig>) -> Self {
        Self {
            networks,
            worker_restart_delay_ms: default_worker_restart_delay_ms(),
            rpc_max_parallel_requests: default_rpc_max_parallel_requests(),
            rpc_max_retry_count: default_rpc_max_retry_count(),
            rpc_ping_delay_ms: default_rpc_ping_delay_ms(),
            rpc_pong_max_wait_ms: default_rpc_pong_max_wait_ms(),
            rpc_retry_delay_ms: default_rpc_retry_delay_ms(),
            rpc_connect_timeout_ms: default_rpc_connect_timeout_ms(),
            backfill_batch_size: default_backfill_batch_size(),
            broker_channel_capacity: default_broker_channel_capacity(),
            log: LogConfig::default(),
        }
    }

    /// Load, apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            Some("json") => Self::from_json(&contents),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Apply `CHAINSYNC_*` overrides from a set of environment variables.
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if key == LOG_LEVEL_ENV {
                debug!(level = %value, "overriding log level from environment");
                self.log.level = value;
            } else if let Some(id) = key.strip_prefix(RPC_URL_ENV_PREFIX) {
                let Ok(chain_id) = id.parse::<u64>() else {
                    continue;
                };
                if let Some(network) = self.networks.iter_mut().find(|n| n.chain_id == chain_id) {
                    debug!(chain_id, "overriding RPC URL from environment");
                    network.rpc_url = value;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.networks.is_empty() {
            return Err(ConfigError::Invalid("no networks configured".into()));
        }

        let mut seen = HashSet::new();
        for network in &self.networks {
            if !seen.insert(network.chain_id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate chain id {}",
                    network.chain_id
                )));
            }
            if !(network.rpc_url.starts_with("ws://") || network.rpc_url.starts_with("wss://")) {
                return Err(ConfigError::Invalid(format!(
                    "chain {}: rpc_url must be a ws:// or wss:// endpoint",
                    network.chain_id
                )));
            }
        }

        let delays = [
            ("worker_restart_delay_ms", self.worker_restart_delay_ms),
            ("rpc_ping_delay_ms", self.rpc_ping_delay_ms),
            ("rpc_pong_max_wait_ms", self.rpc_pong_max_wait_ms),
            ("rpc_retry_delay_ms", self.rpc_retry_delay_ms),
            ("rpc_connect_timeout_ms", self.rpc_connect_timeout_ms),
            ("backfill_batch_size", self.backfill_batch_size),
        ];
        if let Some((name, _)) = delays.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.rpc_max_retry_count == 0 {
            return Err(ConfigError::Invalid(
                "rpc_max_retry_count must be greater than zero".into(),
            ));
        }
        if self.rpc_max_parallel_requests > 1 {
            warn!(
                requested = self.rpc_max_parallel_requests,
                "parallel requests are not supported; requests are sent one at a time"
            );
        }
        Ok(())
    }

    /// Look up a network by chain id.
    pub fn network(&self, chain_id: u64) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.chain_id == chain_id)
    }

    pub fn worker_restart_delay(&self) -> Duration {
        Duration::from_millis(self.worker_restart_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_connect_timeout_ms)
    }
}
