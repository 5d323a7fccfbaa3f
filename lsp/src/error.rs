//! Error taxonomy surfaced to callers of the connection and bridge.

use std::time::Duration;

use crate::lifecycle::LifecycleState;
use crate::protocol::ResponseError;

/// Failure of a call against the language server.
///
/// Every variant is terminal for the call that produced it; retryable
/// empty/incomplete results are not errors (see [`crate::retry`]).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// The server answered with a JSON-RPC error object.
    #[error("server returned error: {0}")]
    Protocol(#[from] ResponseError),
    #[error("connection not ready (state: {0})")]
    NotReady(LifecycleState),
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// The writer is gone (stdin closed or the process exited).
    #[error("transport closed")]
    TransportClosed,
    #[error("request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("unexpected result for '{method}': {message}")]
    InvalidResult { method: String, message: String },
    /// The background runtime of a bridge is gone.
    #[error("bridge runtime is not running")]
    BridgeStopped,
}

impl RpcError {
    /// The server's error code, for protocol errors.
    #[must_use]
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Protocol(e) => Some(e.code),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<crate::protocol::PathToUriError> for RpcError {
    fn from(e: crate::protocol::PathToUriError) -> Self {
        Self::InvalidPath(e.to_string())
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
