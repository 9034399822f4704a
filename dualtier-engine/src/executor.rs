//! Cache executor: runs routed calls against the local tier, the remote
//! tier, or both, and keeps cached tables coherent with the remote.
//!
//! Cached tables are populated by subscribing a remote live query first
//! and then snapshotting the table. A mirror task per subscription applies
//! CREATE/UPDATE/DELETE notifications to the local copy, but never while a
//! snapshot of the same table is being taken: notifications queue behind
//! the snapshot and land on top of it, so no change between the two is lost.

use crate::config::CacheStrategy;
use crate::connection::ConnectionManager;
use crate::error::{EngineError, EngineResult};
use crate::remote::RemoteStore;
use crate::router::QueryRouter;
use crate::types::{
    ExecuteOptions, ExecutionResult, LiveAction, LiveNotification, QueryAnalysis, QueryKind,
    RouteStrategy, RpcCall, Source,
};
use chrono::Utc;
use dualtier_storage::{CacheMetadata, LocalStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Subscription {
    id: Uuid,
    mirror: JoinHandle<()>,
}

struct ExecutorInner {
    connection: ConnectionManager,
    router: QueryRouter,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    /// Held for writing while a table is snapshotted, for reading while a
    /// notification is mirrored into it.
    gates: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

/// Executes data calls on the tier chosen by the router.
#[derive(Clone)]
pub struct CacheExecutor {
    inner: Arc<ExecutorInner>,
}

/// Data plus where it came from, before timing is attached.
struct Outcome {
    data: Value,
    source: Source,
    cache_hit: bool,
    stale: bool,
}

impl Outcome {
    fn new(data: Value, source: Source, cache_hit: bool) -> Self {
        Self {
            data,
            source,
            cache_hit,
            stale: false,
        }
    }
}

impl CacheExecutor {
    pub fn new(connection: ConnectionManager, router: QueryRouter) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                connection,
                router,
                subscriptions: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self, table: &str) -> Arc<RwLock<()>> {
        self.inner
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(table.to_string())
            .or_default()
            .clone()
    }

    fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    fn router(&self) -> &QueryRouter {
        &self.inner.router
    }

    /// Route and run one call.
    pub async fn execute_rpc(
        &self,
        call: RpcCall,
        options: ExecuteOptions,
    ) -> EngineResult<ExecutionResult> {
        let started = Instant::now();
        let (analysis, route) = self.router().route_call(&call).await?;
        debug!(
            "{} routed {} ({})",
            call.method(),
            route.strategy,
            route.rationale
        );

        let outcome = match route.strategy {
            RouteStrategy::LocalOnly => self.run_local_route(&call, &analysis).await,
            RouteStrategy::RemoteOnly => self.run_remote_route(&call, &analysis).await,
            RouteStrategy::Hybrid => self.run_hybrid_route(&call, &analysis, options).await,
        };
        let elapsed_ms = elapsed_ms(started);

        match outcome {
            Ok(outcome) => Ok(ExecutionResult {
                data: outcome.data,
                source: outcome.source,
                execution_time_ms: elapsed_ms,
                cache_hit: outcome.cache_hit,
                stale: outcome.stale,
                route,
            }),
            Err(e) => Err(EngineError::execution(
                route.strategy,
                route.rationale,
                elapsed_ms,
                e,
            )),
        }
    }

    // ── Routes ──

    async fn run_local_route(&self, call: &RpcCall, analysis: &QueryAnalysis) -> EngineResult<Outcome> {
        let data = self.run_local(call).await?;
        if !self.connection().has_remote_config() {
            return Ok(Outcome::new(data, Source::Local, false));
        }
        let strategies: Vec<CacheStrategy> = analysis
            .tables
            .iter()
            .map(|t| self.router().strategy_for(t))
            .collect();
        let cache_hit = strategies.iter().any(|s| *s != CacheStrategy::LocalOnly);
        let source = if strategies.contains(&CacheStrategy::Hybrid) {
            Source::Hybrid
        } else {
            Source::Local
        };
        Ok(Outcome::new(data, source, cache_hit))
    }

    async fn run_remote_route(
        &self,
        call: &RpcCall,
        analysis: &QueryAnalysis,
    ) -> EngineResult<Outcome> {
        let data = self.run_remote(call).await?;
        self.spawn_mirror_of_result(call, analysis, &data);
        Ok(Outcome::new(data, Source::Remote, false))
    }

    async fn run_hybrid_route(
        &self,
        call: &RpcCall,
        analysis: &QueryAnalysis,
        options: ExecuteOptions,
    ) -> EngineResult<Outcome> {
        if analysis.kind == QueryKind::Read {
            match self.hybrid_read(call, analysis).await {
                Ok(outcome) => Ok(outcome),
                Err(e) if options.allow_stale => {
                    warn!("hybrid read failed, serving stale local rows: {e}");
                    match self.run_local(call).await {
                        Ok(data) => Ok(Outcome {
                            data,
                            source: Source::Local,
                            cache_hit: false,
                            stale: true,
                        }),
                        Err(local) => {
                            debug!("stale fallback failed: {local}");
                            Err(e)
                        }
                    }
                }
                Err(e) => Err(e),
            }
        } else {
            self.hybrid_write(call, analysis).await
        }
    }

    async fn hybrid_read(&self, call: &RpcCall, analysis: &QueryAnalysis) -> EngineResult<Outcome> {
        let cached = self.router().cached_tables(&analysis.tables).await?;
        let needs_local = analysis
            .tables
            .iter()
            .any(|t| self.router().strategy_for(t) == CacheStrategy::LocalOnly);
        let mut missing = Vec::new();
        for table in &analysis.tables {
            match self.router().strategy_for(table) {
                CacheStrategy::LocalOnly | CacheStrategy::RemoteOnly => {}
                CacheStrategy::RemoteFirst if !needs_local => {}
                _ if cached.contains(table) => {}
                _ => missing.push(table.clone()),
            }
        }

        if missing.is_empty() {
            let data = self.run_local(call).await?;
            return Ok(Outcome::new(data, Source::Hybrid, true));
        }

        if needs_local {
            // The remote cannot answer for local-only tables: fill the
            // cache first, then answer locally.
            for table in &missing {
                self.populate_table(table).await?;
            }
            let data = self.run_local(call).await?;
            return Ok(Outcome::new(data, Source::Hybrid, false));
        }

        let data = self.run_remote(call).await?;
        for table in &missing {
            if let Err(e) = self.populate_table(table).await {
                warn!("failed to populate cache for {table}: {e}");
            }
        }
        Ok(Outcome::new(data, Source::Hybrid, false))
    }

    /// Remote first, then mirror into the local tier. A failed mirror
    /// leaves the remote write in place and deactivates the affected caches.
    async fn hybrid_write(&self, call: &RpcCall, analysis: &QueryAnalysis) -> EngineResult<Outcome> {
        let data = self.run_remote(call).await?;

        let mirrored = match call {
            RpcCall::Query { .. } => self.run_local(call).await.map(|_| ()),
            _ => self.mirror_record_write(call, &data).await,
        };
        if let Err(e) = mirrored {
            warn!("local mirror of {} failed: {e}", call.method());
            self.deactivate_caches(analysis.tables.iter().cloned().collect())
                .await;
        }
        Ok(Outcome::new(data, Source::Hybrid, false))
    }

    // ── Tiers ──

    async fn run_local(&self, call: &RpcCall) -> EngineResult<Value> {
        let store = self.connection().local()?;
        let call = call.clone();
        let data = tokio::task::spawn_blocking(move || execute_local(&store, &call)).await??;
        Ok(data)
    }

    fn online_remote(&self) -> EngineResult<Arc<dyn RemoteStore>> {
        self.connection()
            .online_remote()
            .ok_or(EngineError::RemoteUnavailable)
    }

    async fn run_remote(&self, call: &RpcCall) -> EngineResult<Value> {
        let remote = self.online_remote()?;
        let result = execute_remote(remote.as_ref(), call).await;
        if let Err(e) = &result {
            if e.is_connection_error() {
                self.connection().notify_remote_lost();
            }
        }
        result
    }

    async fn mirror_record_write(&self, call: &RpcCall, data: &Value) -> EngineResult<()> {
        let store = self.connection().local()?;
        let call = call.clone();
        let data = data.clone();
        tokio::task::spawn_blocking(move || apply_record_write(&store, &call, &data)).await??;
        Ok(())
    }

    /// Mirror a remote-only result without delaying the response.
    /// Selected records of cacheable tables are upserted, record writes are
    /// applied when the table is cached, and raw writes invalidate caches.
    fn spawn_mirror_of_result(&self, call: &RpcCall, analysis: &QueryAnalysis, data: &Value) {
        let Ok(store) = self.connection().local() else {
            return;
        };
        let tables: Vec<String> = analysis
            .tables
            .iter()
            .filter(|t| self.router().strategy_for(t).is_cacheable())
            .cloned()
            .collect();
        if tables.is_empty() {
            return;
        }
        let call = call.clone();
        let data = data.clone();
        let kind = analysis.kind;

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || -> EngineResult<()> {
                match (&call, kind) {
                    (RpcCall::Select { .. }, _) => {
                        upsert_rows(&store, &tables[0], &data)?;
                    }
                    (RpcCall::Query { .. }, QueryKind::Read) => {}
                    (RpcCall::Query { .. }, _) => {
                        for table in &tables {
                            store.deactivate_cache(table)?;
                        }
                    }
                    (_, _) => {
                        let table = &tables[0];
                        if store.get_cache_metadata(table)?.is_some() {
                            apply_record_write(&store, &call, &data)?;
                        }
                    }
                }
                Ok(())
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("background mirror failed: {e}"),
                Err(e) => warn!("background mirror task failed: {e}"),
            }
        });
    }

    async fn deactivate_caches(&self, tables: Vec<String>) {
        let Ok(store) = self.connection().local() else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || {
            for table in &tables {
                store.deactivate_cache(table)?;
            }
            Ok::<_, dualtier_storage::StorageError>(())
        })
        .await;
        if !matches!(result, Ok(Ok(()))) {
            warn!("failed to deactivate caches");
        }
    }

    // ── Cache population ──

    /// Subscribe (when the table's policy asks for it), snapshot the remote
    /// table into the local tier, and record its metadata.
    pub async fn populate_table(&self, table: &str) -> EngineResult<CacheMetadata> {
        let remote = self.online_remote()?;
        let policy = self.router().table_config(table);
        let gate = self.gate(table);
        let _snapshotting = gate.write().await;

        let live_id = if policy.should_subscribe() {
            Some(self.ensure_subscription(table, &remote).await?)
        } else {
            None
        };

        let rows = match remote.select(table, None).await {
            Ok(rows) => rows,
            Err(e) => {
                if e.is_connection_error() {
                    self.connection().notify_remote_lost();
                }
                return Err(e);
            }
        };

        let store = self.connection().local()?;
        let now = Utc::now();
        let meta = CacheMetadata {
            table_name: table.to_string(),
            cache_type: policy.cache_type(),
            live_query_uuid: live_id.map(|id| id.to_string()),
            record_count: i64::try_from(rows.len()).unwrap_or(i64::MAX),
            last_sync_time: now,
            expires_at: policy.ttl().map(|ttl| now + ttl),
            is_active: true,
        };
        let saved = meta.clone();
        let table_name = table.to_string();
        tokio::task::spawn_blocking(move || {
            store.replace_table(&table_name, &rows)?;
            store.save_cache_metadata(&saved)
        })
        .await??;

        info!("cached {} ({} records)", table, meta.record_count);
        Ok(meta)
    }

    /// Existing live subscription of `table`, or a new one.
    async fn ensure_subscription(
        &self,
        table: &str,
        remote: &Arc<dyn RemoteStore>,
    ) -> EngineResult<Uuid> {
        let running = self
            .subscriptions()
            .get(table)
            .filter(|sub| !sub.mirror.is_finished())
            .map(|sub| sub.id);
        if let Some(id) = running {
            return Ok(id);
        }

        let stream = match remote.live(table).await {
            Ok(stream) => stream,
            Err(e) => {
                if e.is_connection_error() {
                    self.connection().notify_remote_lost();
                }
                return Err(e);
            }
        };
        let id = stream.id;

        let raced = {
            let mut subs = self.subscriptions();
            match subs.get(table) {
                Some(existing) if !existing.mirror.is_finished() => Some(existing.id),
                _ => {
                    let mirror = tokio::spawn(mirror_loop(
                        self.clone(),
                        table.to_string(),
                        id,
                        stream.notifications,
                    ));
                    if let Some(old) = subs.insert(table.to_string(), Subscription { id, mirror }) {
                        old.mirror.abort();
                    }
                    None
                }
            }
        };

        match raced {
            Some(existing) => {
                // Another population won; drop the duplicate live query.
                if let Err(e) = remote.kill(id).await {
                    debug!("failed to kill duplicate live query {id}: {e}");
                }
                Ok(existing)
            }
            None => {
                debug!("subscribed {table} as live query {id}");
                Ok(id)
            }
        }
    }

    async fn stop_subscription(&self, table: &str) {
        let removed = self.subscriptions().remove(table);
        let Some(sub) = removed else {
            return;
        };
        sub.mirror.abort();
        if let Some(remote) = self.connection().online_remote() {
            if let Err(e) = remote.kill(sub.id).await {
                warn!("failed to kill live query {} of {table}: {e}", sub.id);
            }
        }
    }

    /// End every cache subscription. Local rows and metadata stay.
    pub async fn stop_all_subscriptions(&self) {
        let tables: Vec<String> = self.subscriptions().keys().cloned().collect();
        for table in tables {
            self.stop_subscription(&table).await;
        }
    }

    /// Tables with a running mirror task.
    pub fn subscribed_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .subscriptions()
            .iter()
            .filter(|(_, sub)| !sub.mirror.is_finished())
            .map(|(table, _)| table.clone())
            .collect();
        tables.sort();
        tables
    }

    /// Drop the cache of the given tables, or of every cached table.
    /// Returns the tables cleared. A failure on one table is logged and
    /// does not stop the others.
    pub async fn clear_cache(&self, tables: Option<Vec<String>>) -> EngineResult<Vec<String>> {
        let tables = match tables {
            Some(tables) => tables,
            None => {
                let mut all: Vec<String> = self
                    .cache_metadata()
                    .await?
                    .into_iter()
                    .map(|m| m.table_name)
                    .collect();
                let subscribed: Vec<String> = self.subscriptions().keys().cloned().collect();
                for table in subscribed {
                    if !all.contains(&table) {
                        all.push(table);
                    }
                }
                all
            }
        };
        let store = self.connection().local()?;

        let mut cleared = Vec::new();
        for table in tables {
            self.stop_subscription(&table).await;
            let store = store.clone();
            let name = table.clone();
            let result = tokio::task::spawn_blocking(move || {
                store.drop_table(&name)?;
                store.delete_cache_metadata(&name)
            })
            .await;
            match result {
                Ok(Ok(_)) => cleared.push(table),
                Ok(Err(e)) => warn!("failed to clear cache of {table}: {e}"),
                Err(e) => warn!("failed to clear cache of {table}: {e}"),
            }
        }
        info!("cleared cache of {} table(s)", cleared.len());
        Ok(cleared)
    }

    /// All cache metadata rows.
    pub async fn cache_metadata(&self) -> EngineResult<Vec<CacheMetadata>> {
        let store = self.connection().local()?;
        Ok(tokio::task::spawn_blocking(move || store.list_cache_metadata()).await??)
    }

    /// Populate every preload table that is not already cached.
    /// Returns the tables populated.
    pub async fn preload(&self) -> Vec<String> {
        let mut loaded = Vec::new();
        if self.connection().online_remote().is_none() {
            return loaded;
        }
        for table in self.router().preload_tables() {
            match self.router().is_table_cached(&table).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!("cache lookup for {table} failed: {e}");
                    continue;
                }
            }
            match self.populate_table(&table).await {
                Ok(_) => loaded.push(table),
                Err(e) => warn!("preload of {table} failed: {e}"),
            }
        }
        loaded
    }

    /// Re-establish live subscriptions after a reconnect. Each subscribed
    /// cache is repopulated so changes missed while offline are picked up.
    pub async fn resubscribe(&self) -> Vec<String> {
        let metadata = match self.cache_metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("cannot resubscribe: {e}");
                return Vec::new();
            }
        };

        let mut restored = Vec::new();
        for meta in metadata {
            let policy = self.router().table_config(&meta.table_name);
            if !meta.is_active || !policy.should_subscribe() || !policy.strategy.is_cacheable() {
                continue;
            }
            self.forget_subscription(&meta.table_name);
            match self.populate_table(&meta.table_name).await {
                Ok(_) => restored.push(meta.table_name),
                Err(e) => warn!("resubscribe of {} failed: {e}", meta.table_name),
            }
        }
        restored
    }

    /// Drop the local record of a subscription whose stream is gone.
    fn forget_subscription(&self, table: &str) {
        if let Some(sub) = self.subscriptions().remove(table) {
            sub.mirror.abort();
        }
    }

    /// Apply one live notification to the local copy of `table`.
    async fn apply_notification(&self, table: &str, notification: LiveNotification) -> EngineResult<()> {
        let store = self.connection().local()?;
        let table = table.to_string();
        tokio::task::spawn_blocking(move || {
            match notification.action {
                LiveAction::Create | LiveAction::Update => {
                    store.upsert_record(&table, &notification.result)?;
                }
                LiveAction::Delete => {
                    if let Some(id) = record_id_of(&notification.result) {
                        store.delete_record(&table, &id)?;
                    }
                }
            }
            let count = store.count_records(&table)?;
            store.record_cache_sync(&table, count, Utc::now())?;
            Ok::<_, dualtier_storage::StorageError>(())
        })
        .await??;
        Ok(())
    }
}

/// Drain a live stream into the local tier. When the stream ends on its
/// own the remote connection is reported lost.
async fn mirror_loop(
    executor: CacheExecutor,
    table: String,
    id: Uuid,
    mut notifications: mpsc::UnboundedReceiver<LiveNotification>,
) {
    let gate = executor.gate(&table);
    while let Some(notification) = notifications.recv().await {
        let _mirroring = gate.read().await;
        if let Err(e) = executor.apply_notification(&table, notification).await {
            warn!("failed to mirror change on {table}: {e}");
        }
    }

    let ours = {
        let mut subs = executor.subscriptions();
        match subs.get(&table) {
            Some(sub) if sub.id == id => subs.remove(&table).is_some(),
            _ => false,
        }
    };
    if ours {
        debug!("live query {id} on {table} ended");
        executor.connection().notify_remote_lost();
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn record_id_of(record: &Value) -> Option<String> {
    match record.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
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

fn execute_local(store: &LocalStore, call: &RpcCall) -> EngineResult<Value> {
    let data = match call {
        RpcCall::Query { sql, vars } => Value::Array(store.execute(sql, vars)?),
        RpcCall::Select { table, id } => Value::Array(store.select_records(table, id.as_deref())?),
        RpcCall::Create { table, id, data } => {
            let id = id
                .clone()
                .or_else(|| record_id_of(data))
                .unwrap_or_else(|| Uuid::now_v7().to_string());
            store.upsert_record(table, &with_id(data, &id)?)?
        }
        RpcCall::Update { table, id, data } => store.upsert_record(table, &with_id(data, id)?)?,
        RpcCall::Merge { table, id, data } => store.merge_record(table, id, data)?,
        RpcCall::Delete { table, id } => store.delete_record(table, id)?.unwrap_or(Value::Null),
    };
    Ok(data)
}

async fn execute_remote(remote: &dyn RemoteStore, call: &RpcCall) -> EngineResult<Value> {
    let data = match call {
        RpcCall::Query { sql, vars } => Value::Array(remote.query(sql, vars).await?),
        RpcCall::Select { table, id } => Value::Array(remote.select(table, id.as_deref()).await?),
        RpcCall::Create { table, id, data } => remote.create(table, id.as_deref(), data).await?,
        RpcCall::Update { table, id, data } => remote.update(table, id, data).await?,
        RpcCall::Merge { table, id, data } => remote.merge(table, id, data).await?,
        RpcCall::Delete { table, id } => remote.delete(table, id).await?.unwrap_or(Value::Null),
    };
    Ok(data)
}

/// Mirror the record returned by a remote write.
fn apply_record_write(store: &LocalStore, call: &RpcCall, data: &Value) -> EngineResult<()> {
    let Some(table) = call.table() else {
        return Ok(());
    };
    match call {
        RpcCall::Delete { id, .. } => {
            store.delete_record(table, id)?;
        }
        RpcCall::Create { .. } | RpcCall::Update { .. } | RpcCall::Merge { .. } => {
            if data.is_object() {
                store.upsert_record(table, data)?;
            }
        }
        RpcCall::Query { .. } | RpcCall::Select { .. } => return Ok(()),
    }
    let count = store.count_records(table)?;
    store.record_cache_sync(table, count, Utc::now())?;
    Ok(())
}

fn upsert_rows(store: &LocalStore, table: &str, data: &Value) -> EngineResult<()> {
    let Some(rows) = data.as_array() else {
        return Ok(());
    };
    for row in rows {
        if record_id_of(row).is_some() {
            store.upsert_record(table, row)?;
        }
    }
    Ok(())
}

impl std::fmt::Debug for CacheExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheExecutor")
            .field("subscriptions", &self.subscribed_tables())
            .finish()
    }
}
