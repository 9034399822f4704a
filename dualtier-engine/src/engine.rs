//! Background engine: owns the connection, router, executor and offline
//! queue, and serves bridge requests.
//!
//! Each request runs on its own task so a slow remote call never blocks
//! the loop. The loop also drives the periodic offline sync and reacts to
//! connectivity coming back.

use crate::bridge::{BridgeEndpoint, BridgeMessage, EngineBridge, RpcError};
use crate::config::EngineConfig;
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{EngineError, EngineResult};
use crate::executor::CacheExecutor;
use crate::offline_queue::OfflineQueue;
use crate::remote::RemoteConnector;
use crate::router::QueryRouter;
use crate::types::{Credentials, ExecuteOptions, NewOperation, QueryKind, RouteStrategy, RpcCall};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Start an engine on the current runtime.
///
/// Returns the application-side bridge and the engine task. The engine
/// stops once every bridge clone is dropped.
pub fn spawn_engine(
    config: EngineConfig,
    connector: Arc<dyn RemoteConnector>,
) -> (EngineBridge, JoinHandle<()>) {
    let (bridge, endpoint) = EngineBridge::new();
    let engine = Engine::new(config, connector, endpoint.outbound.clone());
    let handle = tokio::spawn(engine.run(endpoint));
    (bridge, handle)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    #[serde(default)]
    tenant_code: Option<String>,
}

/// Engine state shared by every request task.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    connection: ConnectionManager,
    router: QueryRouter,
    executor: CacheExecutor,
    queue: OfflineQueue,
    outbound: mpsc::Sender<BridgeMessage>,
    live: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn RemoteConnector>,
        outbound: mpsc::Sender<BridgeMessage>,
    ) -> Self {
        let config = Arc::new(config);
        let connection = ConnectionManager::new(connector);
        let router = QueryRouter::new(config.clone(), connection.clone());
        let executor = CacheExecutor::new(connection.clone(), router.clone());
        let queue = OfflineQueue::new(
            connection.clone(),
            executor.clone(),
            config.offline_max_retries,
        );
        Self {
            config,
            connection,
            router,
            executor,
            queue,
            outbound,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn executor(&self) -> &CacheExecutor {
        &self.executor
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Application live queries with a running forwarder.
    pub fn live_query_ids(&self) -> Vec<Uuid> {
        self.live().keys().copied().collect()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serve requests until the bridge closes.
    pub async fn run(self, endpoint: BridgeEndpoint) {
        let BridgeEndpoint {
            mut requests,
            ready,
            ..
        } = endpoint;

        let mut recovered_rx = self.connection.subscribe_recovered();

        let mut sync_tick = self.config.auto_sync_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        // Skip first immediate tick
        if let Some(interval) = sync_tick.as_mut() {
            interval.tick().await;
        }

        ready.mark_ready();
        info!("engine started");

        loop {
            tokio::select! {
                message = requests.recv() => match message {
                    Some(BridgeMessage::RpcRequest { request_id, method, params }) => {
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.handle_request(request_id, method, params).await;
                        });
                    }
                    Some(other) => warn!("engine ignoring {} message", other.kind()),
                    None => {
                        info!("bridge closed, stopping engine");
                        break;
                    }
                },
                _ = next_tick(&mut sync_tick) => {
                    let queue = self.queue.clone();
                    tokio::spawn(async move {
                        queue.start_auto_sync().await;
                    });
                }
                changed = recovered_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.spawn_recovery();
                }
            }
        }

        self.shutdown().await;
        info!("engine stopped");
    }

    /// Once a reconnect has replayed sign-in: re-establish cache
    /// subscriptions and flush the offline queue.
    fn spawn_recovery(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            let restored = engine.executor.resubscribe().await;
            if !restored.is_empty() {
                info!("resubscribed {} cached table(s)", restored.len());
            }
            engine.queue.start_auto_sync().await;
        });
    }

    async fn shutdown(&self) {
        let forwarders: Vec<JoinHandle<()>> = self.live().drain().map(|(_, h)| h).collect();
        for forwarder in forwarders {
            forwarder.abort();
        }
        self.executor.stop_all_subscriptions().await;
        self.connection.disconnect().await;
    }

    async fn handle_request(self, request_id: u64, method: String, params: Value) {
        let outcome = self.dispatch(&method, params).await.map_err(|e| {
            debug!("{method} failed: {e}");
            RpcError::from(&e)
        });
        let response = BridgeMessage::response(request_id, outcome);
        if self.outbound.send(response).await.is_err() {
            debug!("bridge closed before response to request {request_id}");
        }
    }

    /// Run one bridge method.
    pub async fn dispatch(&self, method: &str, params: Value) -> EngineResult<Value> {
        match method {
            // ── Connection ──
            "connect" => {
                let params: ConnectParams = optional_arg(&params, 0)?.unwrap_or_default();
                self.connect(params.tenant_code).await
            }
            "disconnect" => {
                self.executor.stop_all_subscriptions().await;
                self.connection.disconnect().await;
                to_value(self.connection.state())
            }
            "authenticate" => {
                let credentials: Credentials = required_arg(&params, 0, method)?;
                let auth = self.connection.authenticate(credentials).await?;
                self.executor.preload().await;
                to_value(auth)
            }
            "switch_tenant" => {
                let code: String = required_arg(&params, 0, method)?;
                self.executor.stop_all_subscriptions().await;
                self.connection.switch_tenant(&code).await?;
                self.after_open().await;
                to_value(self.connection.state())
            }
            "state" => to_value(self.connection.state()),
            "auth_state" => to_value(self.connection.auth_state()),

            // ── Data ──
            "query" => {
                let call = RpcCall::from_method(method, &params)?;
                let options = optional_arg(&params, 2)?.unwrap_or_default();
                self.query(call, options).await
            }
            "select" => {
                let call = RpcCall::from_method(method, &params)?;
                let options = optional_arg(&params, 1)?.unwrap_or_default();
                to_value(self.executor.execute_rpc(call, options).await?)
            }
            "create" | "update" | "merge" | "delete" => {
                let call = RpcCall::from_method(method, &params)?;
                self.mutate(call).await
            }

            // ── Routing & cache ──
            "analyze_query" => {
                let (sql, vars) = sql_args(&params, method)?;
                to_value(self.router.analyze_query(&sql, &vars))
            }
            "route_query" => {
                let (sql, vars) = sql_args(&params, method)?;
                to_value(self.router.route_query(&sql, &vars).await?)
            }
            "is_table_cached" => {
                let table: String = required_arg(&params, 0, method)?;
                to_value(self.router.is_table_cached(&table).await?)
            }
            "get_cacheable_tables" => to_value(self.router.get_cacheable_tables()),
            "cache_metadata" => to_value(self.executor.cache_metadata().await?),
            "clear_cache" => {
                let tables: Option<Vec<String>> = optional_arg(&params, 0)?;
                to_value(self.executor.clear_cache(tables).await?)
            }

            // ── Live queries ──
            "live" => {
                let table: String = required_arg(&params, 0, method)?;
                self.live_query(&table).await
            }
            "kill" => {
                let id: Uuid = required_arg(&params, 0, method)?;
                self.kill(id).await?;
                Ok(Value::Null)
            }

            // ── Offline queue ──
            "queue_offline_operation" => {
                let op: NewOperation = required_arg(&params, 0, method)?;
                op.validate()?;
                let id = self.queue.queue_offline_operation(op).await;
                Ok(json!({ "operationId": id }))
            }
            "start_auto_sync" => to_value(self.queue.start_auto_sync().await),
            "get_operation_stats" => to_value(self.queue.get_operation_stats()),
            "clear_completed_operations" => {
                let removed = self.queue.clear_completed_operations().await;
                Ok(json!({ "removed": removed }))
            }
            "list_offline_operations" => to_value(self.queue.operations()),

            other => Err(EngineError::UnknownMethod(other.to_string())),
        }
    }

    async fn connect(&self, tenant_code: Option<String>) -> EngineResult<Value> {
        self.executor.stop_all_subscriptions().await;
        let mut config = ConnectionConfig::from(self.config.as_ref());
        if tenant_code.is_some() {
            config.tenant_code = tenant_code;
        }
        self.connection.connect(config).await?;
        self.after_open().await;
        to_value(self.connection.state())
    }

    /// Restore journaled operations and warm the cache of a freshly opened
    /// database, then replay anything restored.
    async fn after_open(&self) {
        match self.queue.restore_from_journal().await {
            Ok(0) => {}
            Ok(_) => {
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    queue.start_auto_sync().await;
                });
            }
            Err(e) => warn!("failed to restore offline journal: {e}"),
        }
        let loaded = self.executor.preload().await;
        if !loaded.is_empty() {
            debug!("preloaded {}", loaded.join(", "));
        }
    }

    /// Raw statements. Writes cannot be queued, so they fail while the
    /// remote is unreachable unless they only touch local tables.
    async fn query(&self, call: RpcCall, options: ExecuteOptions) -> EngineResult<Value> {
        if self.is_offline() {
            let (analysis, route) = self.router.route_call(&call).await?;
            if analysis.kind != QueryKind::Read && route.strategy != RouteStrategy::LocalOnly {
                return Err(EngineError::Offline(
                    "write statements need the remote database".to_string(),
                ));
            }
        }
        to_value(self.executor.execute_rpc(call, options).await?)
    }

    /// Record writes. Queued for replay when the remote is unreachable.
    async fn mutate(&self, call: RpcCall) -> EngineResult<Value> {
        if self.is_offline() {
            let (_, route) = self.router.route_call(&call).await?;
            if route.strategy != RouteStrategy::LocalOnly {
                return self.enqueue(&call).await;
            }
        }

        match self
            .executor
            .execute_rpc(call.clone(), ExecuteOptions::default())
            .await
        {
            Ok(result) => to_value(result),
            Err(e) if e.is_connection_error() => {
                warn!(
                    "{} on {} hit a dead remote, queueing: {e}",
                    call.method(),
                    call.table().unwrap_or("-")
                );
                self.enqueue(&call).await
            }
            Err(e) => Err(e),
        }
    }

    async fn enqueue(&self, call: &RpcCall) -> EngineResult<Value> {
        let op = call.to_offline_operation().ok_or_else(|| {
            EngineError::Offline(format!("{} cannot be queued", call.method()))
        })?;
        let id = self.queue.queue_offline_operation(op).await;
        Ok(json!({ "queued": true, "operationId": id }))
    }

    /// Remote configured but not reachable right now.
    fn is_offline(&self) -> bool {
        self.connection.has_remote_config() && self.connection.online_remote().is_none()
    }

    /// Open an application live query. Notifications are pushed over the
    /// bridge as `live_query_callback` messages.
    async fn live_query(&self, table: &str) -> EngineResult<Value> {
        let remote = self
            .connection
            .online_remote()
            .ok_or(EngineError::RemoteUnavailable)?;
        let mut stream = remote.live(table).await?;
        let id = stream.id;

        let outbound = self.outbound.clone();
        let registry = self.live.clone();
        // Held across the spawn so an instantly ended stream cannot
        // deregister before it is registered.
        let mut live = self.live();
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = stream.notifications.recv().await {
                if outbound.send(notification.into()).await.is_err() {
                    break;
                }
            }
            debug!("live query {id} stream ended");
            registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
        });
        if let Some(previous) = live.insert(id, forwarder) {
            previous.abort();
        }
        drop(live);
        debug!("live query {id} opened on {table}");
        Ok(json!({ "id": id }))
    }

    async fn kill(&self, id: Uuid) -> EngineResult<()> {
        let forwarder = self.live().remove(&id);
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Some(remote) = self.connection.online_remote() {
            remote.kill(id).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.connection.state())
            .field("executor", &self.executor)
            .finish()
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn to_value<T: Serialize>(value: T) -> EngineResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Positional param `idx`; missing or null is `None`.
fn optional_arg<T: DeserializeOwned>(params: &Value, idx: usize) -> EngineResult<Option<T>> {
    match params.as_array().and_then(|args| args.get(idx)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| EngineError::InvalidParams(format!("param {idx}: {e}"))),
    }
}

fn required_arg<T: DeserializeOwned>(params: &Value, idx: usize, method: &str) -> EngineResult<T> {
    optional_arg(params, idx)?
        .ok_or_else(|| EngineError::InvalidParams(format!("{method}: missing param {idx}")))
}

fn sql_args(params: &Value, method: &str) -> EngineResult<(String, Map<String, Value>)> {
    let sql: String = required_arg(params, 0, method)?;
    let vars: Map<String, Value> = optional_arg(params, 1)?.unwrap_or_default();
    Ok((sql, vars))
}
