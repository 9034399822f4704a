//! Dual-tier data access engine.
//!
//! Sits between application code and two databases: an embedded local
//! store and a networked remote store. Provides:
//! - Connection state machine with tenant scoping and backoff reconnection
//! - Per-query routing to the local cache, the remote, or both
//! - Cache population and invalidation through remote live queries
//! - An offline write queue with per-record ordering and bounded retries
//! - A message bridge between the application and the background engine

pub mod bridge;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod executor;
pub mod offline_queue;
pub mod remote;
pub mod router;
pub mod types;

pub use bridge::{BridgeMessage, EngineBridge, RpcError};
pub use config::{CacheStrategy, EngineConfig, RemoteConfig, TableStrategy};
pub use connection::{ConnectionConfig, ConnectionManager};
pub use engine::{Engine, spawn_engine};
pub use error::{EngineError, EngineResult};
pub use executor::CacheExecutor;
pub use offline_queue::OfflineQueue;
pub use router::{QueryRouter, analyze_query};
pub use types::*;

/// Install the `tracing` subscriber used by host applications.
///
/// Honors `RUST_LOG`, defaults to `info`, writes to stderr. Safe to call
/// more than once.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
