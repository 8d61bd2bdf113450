//! Transport-level and query-boundary error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur during a transport operation.
///
/// Cloneable so one upstream failure can be fanned out to every caller
/// waiting on the same request or subscription.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// WebSocket handshake/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// An operation did not complete in time.
    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The liveness ping was not answered in time.
    #[error("No pong received within {ms}ms")]
    PongTimeout { ms: u64 },

    /// The head request was transmitted too many times without an answer.
    #[error("Request {id} exceeded the retry limit after {attempts} transmissions")]
    RetryLimitExceeded { id: u64, attempts: u32 },

    /// The socket closed, or the transport was destroyed.
    #[error("Connection closed")]
    Closed,

    /// The node reports a different chain than the one configured.
    #[error("Connected to chain {actual}, expected chain {expected}")]
    ChainMismatch { expected: u64, actual: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` for structural failures after which the transport
    /// cannot be used again and must be rebuilt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_)
                | Self::Timeout { .. }
                | Self::PongTimeout { .. }
                | Self::RetryLimitExceeded { .. }
                | Self::Closed
                | Self::ChainMismatch { .. }
        )
    }

    /// Returns `true` if this is a node-side error for a single request.
    pub fn is_rpc_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialization(err.to_string())
    }
}

/// Errors raised at the query boundary before a request reaches any worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// No network with this chain id is configured.
    #[error("UNKNOWN_NETWORK")]
    UnknownNetwork(u64),

    /// The network is configured but disabled.
    #[error("DISABLED_NETWORK")]
    DisabledNetwork(u64),
}

impl NetworkError {
    /// The chain id the caller asked for.
    pub fn chain_id(&self) -> u64 {
        match self {
            Self::UnknownNetwork(id) | Self::DisabledNetwork(id) => *id,
        }
    }
}
