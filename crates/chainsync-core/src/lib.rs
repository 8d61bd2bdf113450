//! chainsync-core: foundation traits and types for ChainSync.
//!
//! # Overview
//!
//! ChainSync keeps a local read model in sync with one or more EVM chains
//! over WebSocket JSON-RPC. The core crate defines:
//!
//! - [`ChainTransport`]: the async seam every transport implements
//! - [`TransportConnector`]: builds a transport plus its fatal signal
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`]: wire types
//! - [`TransportError`] / [`NetworkError`]: structured error types
//! - [`Metrics`]: per-chain counters and gauges with a text dump
//! - [`Broker`]: in-process pub/sub keyed by channel name
//! - [`ChainSyncConfig`]: networks, tunables and logging
//! - [`policy`] module: head-of-line retry budget

pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod request;
pub mod transport;

pub use broker::{Broker, BrokerSubscription, DataType};
pub use config::{ChainSyncConfig, ConfigError, LogConfig, NetworkConfig};
pub use error::{NetworkError, TransportError};
pub use metrics::Metrics;
pub use request::{IncomingMessage, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use transport::{ChainTransport, Connected, SubscriptionKind, TagSubscription, TransportConnector};
