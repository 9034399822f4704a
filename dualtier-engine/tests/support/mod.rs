//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use dualtier_engine::remote::{
    LiveStream, MemoryBackend, MemoryConnector, RemoteConnector, RemoteStore,
};
use dualtier_engine::{
    CacheExecutor, CacheStrategy, ConnectionConfig, ConnectionManager, Credentials, EngineConfig,
    EngineError, EngineResult, OfflineQueue, QueryRouter, RemoteConfig, SigninResponse,
    TableStrategy,
};
use dualtier_storage::LocalStore;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Config against an in-process remote: fast reconnects, no background sync.
pub fn remote_config() -> EngineConfig {
    EngineConfig {
        remote: Some(RemoteConfig::new("memory://test")),
        reconnect_base_delay_ms: 10,
        auto_sync_interval_secs: 0,
        ..EngineConfig::default()
    }
}

/// The table set most tests route against.
///
/// - `users`: LOCAL_FIRST, persistent
/// - `orders`: HYBRID, 60 s TTL
/// - `audit`: REMOTE_ONLY
/// - `drafts`: LOCAL_ONLY
/// - anything else: REMOTE_FIRST
pub fn app_config() -> EngineConfig {
    remote_config()
        .with_table("users", TableStrategy::new(CacheStrategy::LocalFirst))
        .with_table("orders", TableStrategy::new(CacheStrategy::Hybrid).with_ttl(60))
        .with_table("audit", TableStrategy::new(CacheStrategy::RemoteOnly))
        .with_table("drafts", TableStrategy::new(CacheStrategy::LocalOnly))
}

pub fn vars(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub fn credentials(principal_id: &str, token: &str) -> Credentials {
    Credentials {
        principal_id: principal_id.into(),
        token: token.into(),
        tenant_code: None,
    }
}

pub fn signin_response(roles: &[&str]) -> SigninResponse {
    SigninResponse {
        token: Some("session-token".into()),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        menus: vec!["dashboard".into()],
        operations: vec!["orders.read".into()],
    }
}

/// Connection, router, executor and queue wired the way the engine wires
/// them, over an in-process remote.
pub struct Harness {
    pub config: EngineConfig,
    pub backend: MemoryBackend,
    pub connector: MemoryConnector,
    pub connection: ConnectionManager,
    pub router: QueryRouter,
    pub executor: CacheExecutor,
    pub queue: OfflineQueue,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_backend(config, MemoryBackend::new())
    }

    pub fn with_backend(config: EngineConfig, backend: MemoryBackend) -> Self {
        let connector = backend.connector();
        let mut harness = Self::with_connector(config, backend, Arc::new(connector.clone()));
        harness.connector = connector;
        harness
    }

    /// Harness whose sessions come from `remote_connector` instead of the
    /// backend's own connector.
    pub fn with_connector(
        config: EngineConfig,
        backend: MemoryBackend,
        remote_connector: Arc<dyn RemoteConnector>,
    ) -> Self {
        let connector = backend.connector();
        let connection = ConnectionManager::new(remote_connector);
        let router = QueryRouter::new(Arc::new(config.clone()), connection.clone());
        let executor = CacheExecutor::new(connection.clone(), router.clone());
        let queue = OfflineQueue::new(
            connection.clone(),
            executor.clone(),
            config.offline_max_retries,
        );
        Self {
            config,
            backend,
            connector,
            connection,
            router,
            executor,
            queue,
        }
    }

    pub async fn connected(config: EngineConfig) -> Self {
        let harness = Self::new(config);
        harness.connect().await;
        harness
    }

    pub async fn connect(&self) {
        self.connection
            .connect(ConnectionConfig::from(&self.config))
            .await
            .unwrap();
    }

    pub fn local(&self) -> LocalStore {
        self.connection.local().unwrap()
    }

    /// Seed the default `app`/`main` remote database.
    pub fn seed(&self, table: &str, records: &[Value]) {
        self.backend.seed("app", "main", table, records).unwrap();
    }

    pub fn remote_records(&self, table: &str) -> Vec<Value> {
        self.backend.records("app", "main", table).unwrap()
    }
}

/// Poll `check` until it holds, failing after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// A change applied to the remote right after a table snapshot is read.
#[derive(Clone)]
pub struct ChangeAfterSnapshot {
    pub table: String,
    pub id: String,
    pub data: Value,
}

/// Behaviour layered over in-process remote sessions.
#[derive(Clone, Default)]
pub struct Script {
    /// Data calls fail as unauthenticated until `signin` succeeds; each
    /// sign-in takes this long.
    pub signin_delay: Option<Duration>,
    /// Applied once, after the first full select of its table.
    pub change_after_snapshot: Option<ChangeAfterSnapshot>,
}

/// Connector handing out [`ScriptedRemote`] sessions over a backend.
pub struct ScriptedConnector {
    backend: MemoryBackend,
    script: Script,
    changed: Arc<AtomicBool>,
}

impl ScriptedConnector {
    pub fn new(backend: &MemoryBackend, script: Script) -> Self {
        Self {
            backend: backend.clone(),
            script,
            changed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl RemoteConnector for ScriptedConnector {
    async fn connect(&self, config: &RemoteConfig) -> EngineResult<Arc<dyn RemoteStore>> {
        let inner = self.backend.connector().connect(config).await?;
        Ok(Arc::new(ScriptedRemote {
            inner,
            backend: self.backend.clone(),
            script: self.script.clone(),
            signed_in: AtomicBool::new(false),
            changed: self.changed.clone(),
        }))
    }
}

pub struct ScriptedRemote {
    inner: Arc<dyn RemoteStore>,
    backend: MemoryBackend,
    script: Script,
    signed_in: AtomicBool,
    changed: Arc<AtomicBool>,
}

impl ScriptedRemote {
    fn check_session(&self) -> EngineResult<()> {
        if self.script.signin_delay.is_some() && !self.signed_in.load(Ordering::SeqCst) {
            return Err(EngineError::Auth("401 not signed in".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
    async fn use_ns(&self, namespace: &str, database: &str) -> EngineResult<()> {
        self.inner.use_ns(namespace, database).await
    }

    async fn signin(&self, credentials: &Credentials) -> EngineResult<SigninResponse> {
        if let Some(delay) = self.script.signin_delay {
            tokio::time::sleep(delay).await;
        }
        let response = self.inner.signin(credentials).await?;
        self.signed_in.store(true, Ordering::SeqCst);
        Ok(response)
    }

    async fn query(&self, sql: &str, vars: &Map<String, Value>) -> EngineResult<Vec<Value>> {
        self.check_session()?;
        self.inner.query(sql, vars).await
    }

    async fn select(&self, table: &str, id: Option<&str>) -> EngineResult<Vec<Value>> {
        self.check_session()?;
        let rows = self.inner.select(table, id).await?;
        if let Some(change) = &self.script.change_after_snapshot {
            if id.is_none() && change.table == table && !self.changed.swap(true, Ordering::SeqCst)
            {
                self.backend
                    .remote()
                    .update(&change.table, &change.id, &change.data)
                    .await?;
            }
        }
        Ok(rows)
    }

    async fn create(&self, table: &str, id: Option<&str>, data: &Value) -> EngineResult<Value> {
        self.check_session()?;
        self.inner.create(table, id, data).await
    }

    async fn update(&self, table: &str, id: &str, data: &Value) -> EngineResult<Value> {
        self.check_session()?;
        self.inner.update(table, id, data).await
    }

    async fn merge(&self, table: &str, id: &str, data: &Value) -> EngineResult<Value> {
        self.check_session()?;
        self.inner.merge(table, id, data).await
    }

    async fn delete(&self, table: &str, id: &str) -> EngineResult<Option<Value>> {
        self.check_session()?;
        self.inner.delete(table, id).await
    }

    async fn live(&self, table: &str) -> EngineResult<LiveStream> {
        self.check_session()?;
        self.inner.live(table).await
    }

    async fn kill(&self, id: Uuid) -> EngineResult<()> {
        self.inner.kill(id).await
    }

    async fn health(&self) -> EngineResult<()> {
        self.inner.health().await
    }

    async fn close(&self) {
        self.signed_in.store(false, Ordering::SeqCst);
        self.inner.close().await;
    }
}
