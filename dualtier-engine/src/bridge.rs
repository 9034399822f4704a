//! Engine bridge: request/response calls and live-query callbacks between
//! the application and the background engine task.
//!
//! The application side holds an [`EngineBridge`]; the engine side owns the
//! matching [`BridgeEndpoint`]. Every call gets a request id and a pending
//! slot that is removed on response or on timeout, whichever comes first.

use crate::error::{EngineError, EngineResult};
use crate::types::{LiveAction, LiveNotification};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub use crate::error::RpcError;

/// Calls without a response within this window fail with a timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 256;

/// Messages exchanged over the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BridgeMessage {
    RpcRequest {
        request_id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    RpcResponse {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
    /// Pushed by the engine only.
    LiveQueryCallback {
        subscription_id: Uuid,
        action: LiveAction,
        result: Value,
    },
}

impl BridgeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::RpcRequest { .. } => "rpc_request",
            BridgeMessage::RpcResponse { .. } => "rpc_response",
            BridgeMessage::LiveQueryCallback { .. } => "live_query_callback",
        }
    }

    /// Response carrying either a result or an error.
    pub fn response(request_id: u64, outcome: Result<Value, RpcError>) -> Self {
        match outcome {
            Ok(result) => BridgeMessage::RpcResponse {
                request_id,
                result: Some(result),
                error: None,
            },
            Err(error) => BridgeMessage::RpcResponse {
                request_id,
                result: None,
                error: Some(error),
            },
        }
    }
}

impl From<LiveNotification> for BridgeMessage {
    fn from(n: LiveNotification) -> Self {
        BridgeMessage::LiveQueryCallback {
            subscription_id: n.subscription_id,
            action: n.action,
            result: n.result,
        }
    }
}

/// Application callback for one live query.
pub type LiveQueryCallback = Arc<dyn Fn(&LiveNotification) -> anyhow::Result<()> + Send + Sync>;

type PendingSender = oneshot::Sender<Result<Value, RpcError>>;

/// Resolved exactly once by the engine when it starts serving requests.
#[derive(Debug)]
pub struct ReadySignal(watch::Sender<bool>);

impl ReadySignal {
    pub fn mark_ready(self) {
        self.0.send_replace(true);
    }
}

/// Awaitable side of a [`ReadySignal`].
#[derive(Debug, Clone)]
pub struct ReadyWait(watch::Receiver<bool>);

impl ReadyWait {
    pub fn is_ready(&self) -> bool {
        *self.0.borrow()
    }

    /// Wait until ready. Fails if the signal is dropped unresolved.
    pub async fn wait(&mut self) -> EngineResult<()> {
        self.0
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::ChannelClosed)
    }
}

pub fn readiness() -> (ReadySignal, ReadyWait) {
    let (tx, rx) = watch::channel(false);
    (ReadySignal(tx), ReadyWait(rx))
}

/// Engine side of the bridge.
pub struct BridgeEndpoint {
    /// Incoming `rpc_request` messages.
    pub requests: mpsc::Receiver<BridgeMessage>,
    /// Outgoing `rpc_response` and `live_query_callback` messages.
    pub outbound: mpsc::Sender<BridgeMessage>,
    pub ready: ReadySignal,
}

struct BridgeInner {
    request_tx: mpsc::Sender<BridgeMessage>,
    pending: Mutex<HashMap<u64, PendingSender>>,
    callbacks: Mutex<HashMap<Uuid, LiveQueryCallback>>,
    next_id: AtomicU64,
    ready: ReadyWait,
    timeout: Duration,
}

/// Application side of the bridge. Cheap to clone.
#[derive(Clone)]
pub struct EngineBridge {
    inner: Arc<BridgeInner>,
}

impl EngineBridge {
    /// Create a bridge with the default request timeout. Must be called
    /// inside a tokio runtime; spawns the response dispatch task.
    pub fn new() -> (Self, BridgeEndpoint) {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> (Self, BridgeEndpoint) {
        let (request_tx, requests) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (signal, ready) = readiness();

        let bridge = Self {
            inner: Arc::new(BridgeInner {
                request_tx,
                pending: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                ready,
                timeout,
            }),
        };
        tokio::spawn(dispatch_loop(Arc::downgrade(&bridge.inner), outbound_rx));

        let endpoint = BridgeEndpoint {
            requests,
            outbound,
            ready: signal,
        };
        (bridge, endpoint)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingSender>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn callbacks(&self) -> MutexGuard<'_, HashMap<Uuid, LiveQueryCallback>> {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Call an engine method. A timeout means the outcome is unknown: the
    /// engine may still complete the call.
    pub async fn call(&self, method: &str, params: Value) -> EngineResult<Value> {
        let deadline = Instant::now() + self.inner.timeout;
        let request_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut ready = self.inner.ready.clone();
        match tokio::time::timeout_at(deadline, ready.wait()).await {
            Ok(result) => result?,
            Err(_) => return Err(self.timeout_error(request_id)),
        }

        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id, tx);

        let request = BridgeMessage::RpcRequest {
            request_id,
            method: method.to_string(),
            params,
        };
        match tokio::time::timeout_at(deadline, self.inner.request_tx.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.pending().remove(&request_id);
                return Err(EngineError::ChannelClosed);
            }
            Err(_) => {
                self.pending().remove(&request_id);
                warn!("{method} request {request_id} timed out waiting for the engine queue");
                return Err(self.timeout_error(request_id));
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(rpc))) => Err(EngineError::Rpc(rpc)),
            Ok(Err(_)) => Err(EngineError::ChannelClosed),
            Err(_) => {
                self.pending().remove(&request_id);
                warn!("{method} request {request_id} timed out");
                Err(self.timeout_error(request_id))
            }
        }
    }

    fn timeout_error(&self, request_id: u64) -> EngineError {
        EngineError::Timeout {
            request_id,
            timeout_ms: u64::try_from(self.inner.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn register_live_query_callback<F>(&self, subscription_id: Uuid, callback: F)
    where
        F: Fn(&LiveNotification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks().insert(subscription_id, Arc::new(callback));
    }

    /// Returns whether a callback was registered.
    pub fn unregister_live_query_callback(&self, subscription_id: Uuid) -> bool {
        self.callbacks().remove(&subscription_id).is_some()
    }

    /// Calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_ready()
    }

    /// Wait until the engine serves requests.
    pub async fn ready(&self) -> EngineResult<()> {
        self.inner.ready.clone().wait().await
    }

    fn resolve(&self, request_id: u64, outcome: Result<Value, RpcError>) {
        let slot = self.pending().remove(&request_id);
        match slot {
            // The caller may have given up between removal and send.
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!("dropping late response for request {request_id}"),
        }
    }

    fn notify(&self, notification: LiveNotification) {
        let callback = self.callbacks().get(&notification.subscription_id).cloned();
        let Some(callback) = callback else {
            debug!(
                "no callback for live query {}",
                notification.subscription_id
            );
            return;
        };

        let id = notification.subscription_id;
        match catch_unwind(AssertUnwindSafe(|| callback(&notification))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("live query callback {id} failed: {e:#}"),
            Err(_) => error!("live query callback {id} panicked"),
        }
    }
}

impl std::fmt::Debug for EngineBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBridge")
            .field("pending", &self.pending_count())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Route engine output to pending calls and live-query callbacks. Holds
/// the bridge weakly so dropping every application handle closes the
/// request channel and stops the engine. Ends when the engine drops its
/// sender; calls still pending then fail.
async fn dispatch_loop(bridge: Weak<BridgeInner>, mut outbound: mpsc::Receiver<BridgeMessage>) {
    while let Some(message) = outbound.recv().await {
        let Some(inner) = bridge.upgrade() else {
            break;
        };
        let bridge = EngineBridge { inner };
        match message {
            BridgeMessage::RpcResponse {
                request_id,
                result,
                error,
            } => {
                let outcome = match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                bridge.resolve(request_id, outcome);
            }
            BridgeMessage::LiveQueryCallback {
                subscription_id,
                action,
                result,
            } => bridge.notify(LiveNotification {
                subscription_id,
                action,
                result,
            }),
            BridgeMessage::RpcRequest { request_id, .. } => {
                warn!("bridge ignoring request {request_id} sent by the engine");
            }
        }
    }
    debug!("engine bridge closed");
    if let Some(inner) = bridge.upgrade() {
        EngineBridge { inner }.pending().clear();
    }
}
