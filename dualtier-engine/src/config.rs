//! Engine configuration.

use crate::error::{EngineError, EngineResult};
use dualtier_storage::CacheType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-table caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStrategy {
    /// Serve from the local cache, populate from remote on miss.
    LocalFirst,
    /// Read remote; mirror results locally.
    RemoteFirst,
    /// Cache kept current by a live subscription; writes go to both tiers.
    Hybrid,
    /// Never leaves the local database.
    LocalOnly,
    /// Never cached.
    RemoteOnly,
}

impl CacheStrategy {
    /// Strategies whose tables may hold local copies of remote data.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            CacheStrategy::LocalFirst | CacheStrategy::RemoteFirst | CacheStrategy::Hybrid
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableStrategy {
    pub strategy: CacheStrategy,
    /// Cache lifetime. `None` keeps the cache until cleared.
    pub ttl_secs: Option<u64>,
    /// Populate the cache right after connect/authenticate.
    pub preload: bool,
}

impl Default for TableStrategy {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::RemoteFirst,
            ttl_secs: None,
            preload: false,
        }
    }
}

impl TableStrategy {
    pub fn new(strategy: CacheStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn preloaded(mut self) -> Self {
        self.preload = true;
        self
    }

    pub fn cache_type(&self) -> CacheType {
        match self.ttl_secs {
            Some(_) => CacheType::Temporary,
            None => CacheType::Persistent,
        }
    }

    /// Cache lifetime; `None` also for values chrono cannot represent.
    pub fn ttl(&self) -> Option<chrono::Duration> {
        self.ttl_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
    }

    /// Populated caches of HYBRID tables, and persistent caches, follow a
    /// remote live query.
    pub fn should_subscribe(&self) -> bool {
        self.strategy == CacheStrategy::Hybrid || self.cache_type() == CacheType::Persistent
    }
}

/// Remote database endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub endpoint_url: String,
    pub request_timeout_secs: u64,
    /// Poll period of HTTP live-query change feeds.
    pub live_poll_interval_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:8000".to_string(),
            request_timeout_secs: 30,
            live_poll_interval_ms: 1000,
        }
    }
}

impl RemoteConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn live_poll_interval(&self) -> Duration {
        Duration::from_millis(self.live_poll_interval_ms.max(1))
    }
}

/// Configuration for the dual-tier engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory of the local database files. `None` keeps them in memory.
    pub local_dir: Option<PathBuf>,

    /// Remote endpoint. `None` runs the engine local-only.
    pub remote: Option<RemoteConfig>,

    /// Remote namespace name before tenant scoping.
    pub namespace_base: String,

    /// Database name (remote and local) before tenant scoping.
    pub database_base: String,

    /// Tenant selected at connect time.
    pub tenant_code: Option<String>,

    /// Per-table strategies.
    pub tables: HashMap<String, TableStrategy>,

    /// Strategy of tables missing from `tables`.
    pub default_strategy: CacheStrategy,

    pub max_reconnect_attempts: u32,

    /// First reconnect delay; doubles on every attempt.
    pub reconnect_base_delay_ms: u64,

    /// Attempts per offline operation before it is marked failed.
    pub offline_max_retries: u32,

    /// Period of the background offline sync. 0 disables it.
    pub auto_sync_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_dir: None,
            remote: None,
            namespace_base: "app".to_string(),
            database_base: "main".to_string(),
            tenant_code: None,
            tables: HashMap::new(),
            default_strategy: CacheStrategy::RemoteFirst,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 1000,
            offline_max_retries: 3,
            auto_sync_interval_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn with_table(mut self, table: impl Into<String>, strategy: TableStrategy) -> Self {
        self.tables.insert(table.into(), strategy);
        self
    }

    /// Policy of `table`, falling back to the default strategy.
    pub fn table(&self, table: &str) -> TableStrategy {
        self.tables
            .get(table)
            .cloned()
            .unwrap_or_else(|| TableStrategy::new(self.default_strategy))
    }

    pub fn strategy_for(&self, table: &str) -> CacheStrategy {
        self.table(table).strategy
    }

    /// Configured tables that may be cached locally, sorted by name.
    pub fn cacheable_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .tables
            .iter()
            .filter(|(_, t)| t.strategy.is_cacheable())
            .map(|(name, _)| name.clone())
            .collect();
        tables.sort();
        tables
    }

    /// Cacheable tables flagged for preloading, sorted by name.
    pub fn preload_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .tables
            .iter()
            .filter(|(_, t)| t.preload && t.strategy.is_cacheable())
            .map(|(name, _)| name.clone())
            .collect();
        tables.sort();
        tables
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn auto_sync_interval(&self) -> Option<Duration> {
        (self.auto_sync_interval_secs > 0).then(|| Duration::from_secs(self.auto_sync_interval_secs))
    }
}

/// `<base>_<code>`, or `base` without a tenant.
pub fn tenant_scoped(base: &str, tenant_code: Option<&str>) -> String {
    match tenant_code {
        Some(code) if !code.is_empty() => format!("{base}_{code}"),
        _ => base.to_string(),
    }
}
