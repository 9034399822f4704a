//! Engine error types.

use crate::types::{ConnectionState, RouteStrategy};
use dualtier_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not connected")]
    NotConnected,

    #[error("remote database unavailable")]
    RemoteUnavailable,

    #[error("invalid connection state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: ConnectionState,
    },

    #[error("{strategy} execution failed after {elapsed_ms} ms ({rationale}): {source}")]
    Execution {
        strategy: RouteStrategy,
        rationale: String,
        elapsed_ms: u64,
        source: Box<EngineError>,
    },

    #[error("remote error: {0}")]
    Remote(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The request may or may not have been applied.
    #[error("request {request_id} timed out after {timeout_ms} ms; outcome unknown")]
    Timeout { request_id: u64, timeout_ms: u64 },

    #[error("{0}")]
    Rpc(RpcError),

    #[error("engine channel closed")]
    ChannelClosed,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("offline: {0}")]
    Offline(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Stable, machine-readable error kind. Carried across the bridge.
    pub fn kind(&self) -> &str {
        match self {
            EngineError::Connection(_) => "connection",
            EngineError::Auth(_) => "auth",
            EngineError::NotConnected => "not_connected",
            EngineError::RemoteUnavailable => "remote_unavailable",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::Execution { .. } => "execution",
            EngineError::Remote(_) => "remote",
            EngineError::Storage(_) => "storage",
            EngineError::Http(_) => "http",
            EngineError::Serialization(_) => "serialization",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Rpc(e) => &e.kind,
            EngineError::ChannelClosed => "channel_closed",
            EngineError::InvalidParams(_) => "invalid_params",
            EngineError::UnknownMethod(_) => "unknown_method",
            EngineError::Config(_) => "config",
            EngineError::Offline(_) => "offline",
            EngineError::Task(_) => "task",
        }
    }

    /// Returns true if the error means the remote tier cannot be reached.
    pub fn is_connection_error(&self) -> bool {
        match self {
            EngineError::Connection(_) | EngineError::RemoteUnavailable => true,
            EngineError::Http(e) => e.is_connect() || e.is_timeout(),
            EngineError::Execution { source, .. } => source.is_connection_error(),
            EngineError::Rpc(e) => matches!(e.kind.as_str(), "connection" | "remote_unavailable"),
            _ => false,
        }
    }

    /// Wrap an execution failure with its route and elapsed time.
    pub fn execution(
        strategy: RouteStrategy,
        rationale: impl Into<String>,
        elapsed_ms: u64,
        source: EngineError,
    ) -> Self {
        EngineError::Execution {
            strategy,
            rationale: rationale.into(),
            elapsed_ms,
            source: Box::new(source),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Task(e.to_string())
    }
}

/// Error payload of an `rpc_response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: String,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&EngineError> for RpcError {
    fn from(e: &EngineError) -> Self {
        match e {
            EngineError::Rpc(inner) => inner.clone(),
            other => RpcError::new(other.kind(), other.to_string()),
        }
    }
}
