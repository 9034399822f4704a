//! In-process remote database.
//!
//! Each namespace/database pair is an in-memory [`LocalStore`]. Record
//! writes notify matching live queries. The backend also carries the
//! knobs tests need: call counting, a write log, injected write failures
//! and a switch that takes the whole remote offline.

use super::{LiveStream, RemoteConnector, RemoteStore};
use crate::config::RemoteConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{Credentials, LiveAction, LiveNotification, SigninResponse};
use async_trait::async_trait;
use dualtier_storage::LocalStore;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// One successful remote write, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub method: &'static str,
    pub table: String,
    pub id: Option<String>,
}

struct Subscriber {
    scope: String,
    table: String,
    tx: mpsc::UnboundedSender<LiveNotification>,
}

struct Principal {
    token: String,
    response: SigninResponse,
}

#[derive(Default)]
struct BackendInner {
    databases: Mutex<HashMap<String, LocalStore>>,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    killed: Mutex<Vec<Uuid>>,
    principals: Mutex<HashMap<String, Principal>>,
    write_log: Mutex<Vec<WriteRecord>>,
    calls: AtomicUsize,
    offline: AtomicBool,
    fail_writes: AtomicUsize,
}

/// Shared state of an in-process remote. Cloning shares it.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn scope(namespace: &str, database: &str) -> String {
    format!("{namespace}/{database}")
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session on the default `app`/`main` database.
    pub fn remote(&self) -> MemoryRemote {
        self.remote_for("app", "main")
    }

    pub fn remote_for(&self, namespace: &str, database: &str) -> MemoryRemote {
        MemoryRemote {
            backend: self.clone(),
            scope: RwLock::new(scope(namespace, database)),
            owned_live: Mutex::new(Vec::new()),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            backend: self.clone(),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Accept `principal_id` signing in with `token`.
    pub fn register_principal(&self, principal_id: &str, token: &str, response: SigninResponse) {
        lock(&self.inner.principals).insert(
            principal_id.to_string(),
            Principal {
                token: token.to_string(),
                response,
            },
        );
    }

    /// Write records directly, bypassing call counting and notifications.
    pub fn seed(
        &self,
        namespace: &str,
        database: &str,
        table: &str,
        records: &[Value],
    ) -> EngineResult<()> {
        let store = self.database(&scope(namespace, database))?;
        for record in records {
            store.upsert_record(table, record)?;
        }
        Ok(())
    }

    /// Current content of a table.
    pub fn records(&self, namespace: &str, database: &str, table: &str) -> EngineResult<Vec<Value>> {
        let store = self.database(&scope(namespace, database))?;
        Ok(store.select_records(table, None)?)
    }

    /// Number of remote calls served (or refused while offline).
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.inner.calls.store(0, Ordering::SeqCst);
    }

    /// Going offline refuses every call and ends all live streams.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
        if offline {
            lock(&self.inner.subscribers).clear();
        }
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Fail the next `count` writes with a remote error.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.fail_writes.store(count, Ordering::SeqCst);
    }

    pub fn write_log(&self) -> Vec<WriteRecord> {
        lock(&self.inner.write_log).clone()
    }

    /// Live query ids killed so far.
    pub fn killed(&self) -> Vec<Uuid> {
        lock(&self.inner.killed).clone()
    }

    pub fn active_live_queries(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    fn database(&self, scope: &str) -> EngineResult<LocalStore> {
        let mut databases = lock(&self.inner.databases);
        if let Some(store) = databases.get(scope) {
            return Ok(store.clone());
        }
        let store = LocalStore::open_in_memory()?;
        databases.insert(scope.to_string(), store.clone());
        Ok(store)
    }

    fn begin_call(&self) -> EngineResult<()> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_offline() {
            return Err(EngineError::Connection("remote unreachable".to_string()));
        }
        Ok(())
    }

    fn begin_write(&self) -> EngineResult<()> {
        let injected = self
            .inner
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EngineError::Remote("injected write failure".to_string()));
        }
        Ok(())
    }

    fn log_write(&self, method: &'static str, table: &str, id: Option<&str>) {
        lock(&self.inner.write_log).push(WriteRecord {
            method,
            table: table.to_string(),
            id: id.map(str::to_string),
        });
    }

    fn notify(&self, scope: &str, table: &str, action: LiveAction, record: &Value) {
        let mut subscribers = lock(&self.inner.subscribers);
        subscribers.retain(|id, sub| {
            if sub.scope != scope || sub.table != table {
                return true;
            }
            sub.tx
                .send(LiveNotification {
                    subscription_id: *id,
                    action,
                    result: record.clone(),
                })
                .is_ok()
        });
    }
}

/// One session against a [`MemoryBackend`].
pub struct MemoryRemote {
    backend: MemoryBackend,
    scope: RwLock<String>,
    owned_live: Mutex<Vec<Uuid>>,
}

impl MemoryRemote {
    fn scope(&self) -> String {
        self.scope
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store(&self) -> EngineResult<(String, LocalStore)> {
        let scope = self.scope();
        let store = self.backend.database(&scope)?;
        Ok((scope, store))
    }
}

fn id_of(data: &Value) -> Option<String> {
    match data.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn with_id(data: &Value, id: &str) -> EngineResult<Value> {
    let mut object = data
        .as_object()
        .cloned()
        .ok_or_else(|| EngineError::InvalidParams("record data must be an object".to_string()))?;
    object.insert("id".to_string(), Value::String(id.to_string()));
    Ok(Value::Object(object))
}

fn is_read_statement(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_uppercase();
    ["SELECT", "WITH", "EXPLAIN", "PRAGMA"]
        .iter()
        .any(|kw| head.starts_with(kw))
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn use_ns(&self, namespace: &str, database: &str) -> EngineResult<()> {
        self.backend.begin_call()?;
        *self
            .scope
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = scope(namespace, database);
        Ok(())
    }

    async fn signin(&self, credentials: &Credentials) -> EngineResult<SigninResponse> {
        self.backend.begin_call()?;
        let principals = lock(&self.backend.inner.principals);
        match principals.get(&credentials.principal_id) {
            Some(p) if p.token == credentials.token => Ok(p.response.clone()),
            Some(_) => Err(EngineError::Auth("invalid token".to_string())),
            None => Err(EngineError::Auth(format!(
                "unknown principal {}",
                credentials.principal_id
            ))),
        }
    }

    async fn query(&self, sql: &str, vars: &Map<String, Value>) -> EngineResult<Vec<Value>> {
        self.backend.begin_call()?;
        let (_, store) = self.store()?;
        if is_read_statement(sql) {
            return Ok(store.execute(sql, vars)?);
        }
        self.backend.begin_write()?;
        let rows = store.execute(sql, vars)?;
        self.backend.log_write("query", "", None);
        Ok(rows)
    }

    async fn select(&self, table: &str, id: Option<&str>) -> EngineResult<Vec<Value>> {
        self.backend.begin_call()?;
        let (_, store) = self.store()?;
        Ok(store.select_records(table, id)?)
    }

    async fn create(&self, table: &str, id: Option<&str>, data: &Value) -> EngineResult<Value> {
        self.backend.begin_call()?;
        self.backend.begin_write()?;
        let (scope, store) = self.store()?;
        let id = id
            .map(str::to_string)
            .or_else(|| id_of(data))
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        if store.get_record(table, &id)?.is_some() {
            return Err(EngineError::Remote(format!("record {table}:{id} already exists")));
        }
        let record = store.upsert_record(table, &with_id(data, &id)?)?;
        self.backend.log_write("create", table, Some(&id));
        self.backend.notify(&scope, table, LiveAction::Create, &record);
        Ok(record)
    }

    async fn update(&self, table: &str, id: &str, data: &Value) -> EngineResult<Value> {
        self.backend.begin_call()?;
        self.backend.begin_write()?;
        let (scope, store) = self.store()?;
        let record = store.upsert_record(table, &with_id(data, id)?)?;
        self.backend.log_write("update", table, Some(id));
        self.backend.notify(&scope, table, LiveAction::Update, &record);
        Ok(record)
    }

    async fn merge(&self, table: &str, id: &str, data: &Value) -> EngineResult<Value> {
        self.backend.begin_call()?;
        self.backend.begin_write()?;
        let (scope, store) = self.store()?;
        let record = store.merge_record(table, id, data)?;
        self.backend.log_write("merge", table, Some(id));
        self.backend.notify(&scope, table, LiveAction::Update, &record);
        Ok(record)
    }

    async fn delete(&self, table: &str, id: &str) -> EngineResult<Option<Value>> {
        self.backend.begin_call()?;
        self.backend.begin_write()?;
        let (scope, store) = self.store()?;
        let removed = store.delete_record(table, id)?;
        self.backend.log_write("delete", table, Some(id));
        if let Some(record) = &removed {
            self.backend.notify(&scope, table, LiveAction::Delete, record);
        }
        Ok(removed)
    }

    async fn live(&self, table: &str) -> EngineResult<LiveStream> {
        self.backend.begin_call()?;
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.backend.inner.subscribers).insert(
            id,
            Subscriber {
                scope: self.scope(),
                table: table.to_string(),
                tx,
            },
        );
        lock(&self.owned_live).push(id);
        debug!("memory remote: live query {id} on {table}");
        Ok(LiveStream {
            id,
            notifications: rx,
        })
    }

    async fn kill(&self, id: Uuid) -> EngineResult<()> {
        self.backend.begin_call()?;
        lock(&self.backend.inner.subscribers).remove(&id);
        lock(&self.backend.inner.killed).push(id);
        Ok(())
    }

    async fn health(&self) -> EngineResult<()> {
        self.backend.begin_call()
    }

    async fn close(&self) {
        let owned: Vec<Uuid> = lock(&self.owned_live).drain(..).collect();
        let mut subscribers = lock(&self.backend.inner.subscribers);
        for id in owned {
            subscribers.remove(&id);
        }
    }
}

/// Connector handing out [`MemoryRemote`] sessions. Refuses to connect
/// while the backend is offline.
#[derive(Clone)]
pub struct MemoryConnector {
    backend: MemoryBackend,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl MemoryConnector {
    /// Instants of every connect attempt, successful or not.
    pub fn attempts(&self) -> Vec<Instant> {
        lock(&self.attempts).clone()
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

#[async_trait]
impl RemoteConnector for MemoryConnector {
    async fn connect(&self, _config: &RemoteConfig) -> EngineResult<Arc<dyn RemoteStore>> {
        lock(&self.attempts).push(Instant::now());
        if self.backend.is_offline() {
            return Err(EngineError::Connection("remote unreachable".to_string()));
        }
        Ok(Arc::new(self.backend.remote()))
    }
}
