//! JSON-over-HTTP remote database client.
//!
//! Every response body is a `{"result": ...}` envelope; failures carry
//! `{"error": "..."}`. The `NS` and `DB` headers select the database and a
//! bearer token is attached after sign-in. Live queries are change feeds
//! polled by a background task per subscription.

use super::{LiveStream, RemoteConnector, RemoteStore};
use crate::config::RemoteConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{Credentials, LiveAction, LiveNotification, SigninResponse};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Session {
    namespace: Option<String>,
    database: Option<String>,
    token: Option<String>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct LiveCreated {
    id: Uuid,
}

#[derive(Deserialize)]
struct ChangeFeed {
    cursor: u64,
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Deserialize)]
struct Change {
    action: LiveAction,
    result: Value,
}

/// HTTP client for the remote database.
pub struct HttpRemote {
    client: Client,
    base_url: String,
    poll_interval: Duration,
    session: Arc<RwLock<Session>>,
    pollers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.endpoint_url.trim_end_matches('/').to_string(),
            poll_interval: config.live_poll_interval(),
            session: Arc::new(RwLock::new(Session::default())),
            pollers: Mutex::new(HashMap::new()),
        })
    }

    /// Current bearer token, if signed in.
    pub async fn token(&self) -> Option<String> {
        self.session.read().await.token.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let session = self.session.read().await.clone();
        authorize(self.client.request(method, self.url(path)), &session)
    }

    fn pollers(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.pollers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn authorize(mut builder: RequestBuilder, session: &Session) -> RequestBuilder {
    if let Some(ns) = &session.namespace {
        builder = builder.header("NS", ns);
    }
    if let Some(db) = &session.database {
        builder = builder.header("DB", db);
    }
    if let Some(token) = &session.token {
        builder = builder.bearer_auth(token);
    }
    builder
}

fn record_path(table: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => format!(
            "/key/{}/{}",
            urlencoding::encode(table),
            urlencoding::encode(id)
        ),
        None => format!("/key/{}", urlencoding::encode(table)),
    }
}

/// Map transport failures: unreachable or timed out is a connection error.
fn transport_error(e: reqwest::Error) -> EngineError {
    if e.is_connect() || e.is_timeout() {
        EngineError::Connection(e.to_string())
    } else {
        EngineError::Http(e)
    }
}

async fn send(builder: RequestBuilder) -> EngineResult<Response> {
    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EngineError::Auth(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            EngineError::Connection(format!("{status}: {message}"))
        }
        _ => EngineError::Remote(format!("{status}: {message}")),
    })
}

async fn result<T: DeserializeOwned>(builder: RequestBuilder) -> EngineResult<T> {
    let envelope: Envelope<T> = send(builder).await?.json().await.map_err(transport_error)?;
    Ok(envelope.result)
}

/// A select may answer with one record, a list, or null.
fn into_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn optional_record(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(mut rows) if rows.len() <= 1 => rows.pop(),
        other => Some(other),
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn use_ns(&self, namespace: &str, database: &str) -> EngineResult<()> {
        let mut session = self.session.write().await;
        session.namespace = Some(namespace.to_string());
        session.database = Some(database.to_string());
        debug!("remote session now on {namespace}/{database}");
        Ok(())
    }

    async fn signin(&self, credentials: &Credentials) -> EngineResult<SigninResponse> {
        let builder = self
            .request(Method::POST, "/signin")
            .await
            .json(credentials);
        let response: SigninResponse = result(builder).await?;

        let token = response
            .token
            .clone()
            .unwrap_or_else(|| credentials.token.clone());
        self.session.write().await.token = Some(token);
        Ok(response)
    }

    async fn query(&self, sql: &str, vars: &Map<String, Value>) -> EngineResult<Vec<Value>> {
        let builder = self
            .request(Method::POST, "/sql")
            .await
            .json(&json!({ "sql": sql, "vars": vars }));
        let rows: Value = result(builder).await?;
        Ok(into_rows(rows))
    }

    async fn select(&self, table: &str, id: Option<&str>) -> EngineResult<Vec<Value>> {
        let builder = self.request(Method::GET, &record_path(table, id)).await;
        let rows: Value = result(builder).await?;
        Ok(into_rows(rows))
    }

    async fn create(&self, table: &str, id: Option<&str>, data: &Value) -> EngineResult<Value> {
        let builder = self
            .request(Method::POST, &record_path(table, id))
            .await
            .json(data);
        result(builder).await
    }

    async fn update(&self, table: &str, id: &str, data: &Value) -> EngineResult<Value> {
        let builder = self
            .request(Method::PUT, &record_path(table, Some(id)))
            .await
            .json(data);
        result(builder).await
    }

    async fn merge(&self, table: &str, id: &str, data: &Value) -> EngineResult<Value> {
        let builder = self
            .request(Method::PATCH, &record_path(table, Some(id)))
            .await
            .json(data);
        result(builder).await
    }

    async fn delete(&self, table: &str, id: &str) -> EngineResult<Option<Value>> {
        let builder = self
            .request(Method::DELETE, &record_path(table, Some(id)))
            .await;
        let removed: Value = result(builder).await?;
        Ok(optional_record(removed))
    }

    async fn live(&self, table: &str) -> EngineResult<LiveStream> {
        let builder = self
            .request(Method::POST, "/live")
            .await
            .json(&json!({ "table": table }));
        let created: LiveCreated = result(builder).await?;
        let id = created.id;

        let (tx, rx) = mpsc::unbounded_channel();
        let poller = tokio::spawn(poll_changes(
            self.client.clone(),
            self.url(&format!("/live/{id}/changes")),
            self.session.clone(),
            self.poll_interval,
            id,
            tx,
        ));
        if let Some(previous) = self.pollers().insert(id, poller) {
            previous.abort();
        }
        debug!("live query {id} opened on {table}");

        Ok(LiveStream {
            id,
            notifications: rx,
        })
    }

    async fn kill(&self, id: Uuid) -> EngineResult<()> {
        if let Some(poller) = self.pollers().remove(&id) {
            poller.abort();
        }
        let builder = self
            .request(Method::DELETE, &format!("/live/{id}"))
            .await;
        send(builder).await?;
        Ok(())
    }

    async fn health(&self) -> EngineResult<()> {
        let builder = self.request(Method::GET, "/health").await;
        send(builder).await?;
        Ok(())
    }

    async fn close(&self) {
        for (_, poller) in self.pollers().drain() {
            poller.abort();
        }
        self.session.write().await.token = None;
    }
}

impl Drop for HttpRemote {
    fn drop(&mut self) {
        for (_, poller) in self.pollers().drain() {
            poller.abort();
        }
    }
}

/// Poll a change feed until the subscription ends or the receiver is
/// dropped. Returning drops `tx`, which ends the stream for the consumer.
async fn poll_changes(
    client: Client,
    url: String,
    session: Arc<RwLock<Session>>,
    period: Duration,
    id: Uuid,
    tx: mpsc::UnboundedSender<LiveNotification>,
) {
    let mut cursor = 0u64;
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }

        let snapshot = session.read().await.clone();
        let builder = authorize(client.get(&url), &snapshot).query(&[("cursor", cursor)]);
        let feed: ChangeFeed = match result(builder).await {
            Ok(feed) => feed,
            Err(e) if e.is_connection_error() => {
                warn!("live query {id} lost its connection: {e}");
                return;
            }
            Err(EngineError::Remote(msg)) if msg.starts_with("404") => {
                debug!("live query {id} no longer exists");
                return;
            }
            Err(e) => {
                warn!("live query {id} poll failed: {e}");
                continue;
            }
        };

        cursor = feed.cursor;
        for change in feed.changes {
            let notification = LiveNotification {
                subscription_id: id,
                action: change.action,
                result: change.result,
            };
            if tx.send(notification).is_err() {
                return;
            }
        }
    }
}

/// Connector opening [`HttpRemote`] sessions after a health check.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector;

impl HttpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteConnector for HttpConnector {
    async fn connect(&self, config: &RemoteConfig) -> EngineResult<Arc<dyn RemoteStore>> {
        let remote = HttpRemote::new(config)?;
        remote.health().await?;
        debug!("connected to {}", config.endpoint_url);
        Ok(Arc::new(remote))
    }
}
