//! Remote tier: the networked source of truth.
//!
//! [`RemoteStore`] is the seam between the engine and a remote database.
//! Two implementations ship with the crate:
//! - [`HttpRemote`], a JSON-over-HTTP client
//! - [`MemoryRemote`], an in-process database for tests and offline work

mod http;
mod memory;

pub use http::{HttpConnector, HttpRemote};
pub use memory::{MemoryBackend, MemoryConnector, MemoryRemote, WriteRecord};

use crate::config::RemoteConfig;
use crate::error::EngineResult;
use crate::types::{Credentials, LiveNotification, SigninResponse};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// An open live query. The channel closes when the subscription ends,
/// either killed or because the connection dropped.
#[derive(Debug)]
pub struct LiveStream {
    pub id: Uuid,
    pub notifications: mpsc::UnboundedReceiver<LiveNotification>,
}

/// Operations the engine needs from the remote database.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Select the namespace and database subsequent calls address.
    async fn use_ns(&self, namespace: &str, database: &str) -> EngineResult<()>;

    async fn signin(&self, credentials: &Credentials) -> EngineResult<SigninResponse>;

    async fn query(&self, sql: &str, vars: &Map<String, Value>) -> EngineResult<Vec<Value>>;

    async fn select(&self, table: &str, id: Option<&str>) -> EngineResult<Vec<Value>>;

    /// Create a record. Without an id (argument or `data.id`) the remote
    /// assigns one.
    async fn create(&self, table: &str, id: Option<&str>, data: &Value) -> EngineResult<Value>;

    /// Replace a record.
    async fn update(&self, table: &str, id: &str, data: &Value) -> EngineResult<Value>;

    /// Merge-patch a record.
    async fn merge(&self, table: &str, id: &str, data: &Value) -> EngineResult<Value>;

    /// Delete a record, returning it if it existed.
    async fn delete(&self, table: &str, id: &str) -> EngineResult<Option<Value>>;

    /// Subscribe to every change of `table`.
    async fn live(&self, table: &str) -> EngineResult<LiveStream>;

    async fn kill(&self, id: Uuid) -> EngineResult<()>;

    async fn health(&self) -> EngineResult<()>;

    /// Drop the session and end every live stream.
    async fn close(&self);
}

/// Opens remote sessions. Called on connect and on every reconnect attempt.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, config: &RemoteConfig) -> EngineResult<Arc<dyn RemoteStore>>;
}
