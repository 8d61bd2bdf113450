//! chainsync-ws: resilient WebSocket JSON-RPC transport.
//!
//! # Features
//! - Strict head-of-line request queue (one request on the wire at a time)
//! - Bounded retransmission on rate limiting and malformed frames
//! - Subscription deduplication by tag (eth_subscribe / eth_unsubscribe)
//! - Ping/pong liveness check that detects half-open connections
//! - A single fatal signal per connection; reconnecting is the caller's job

pub mod client;
pub mod subscriptions;

pub use client::{WsClientConfig, WsConnector, WsTransport};
pub use subscriptions::{SubscriptionId, SubscriptionRegistry};
