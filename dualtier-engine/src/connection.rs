//! Connection manager: owns the local and remote database handles.
//!
//! Handles the connection state machine, tenant scoping, sign-in, and
//! reconnection with exponential backoff after the remote drops.

use crate::config::{EngineConfig, RemoteConfig, tenant_scoped};
use crate::error::{EngineError, EngineResult};
use crate::remote::{RemoteConnector, RemoteStore};
use crate::types::{AuthState, ConnectionState, Credentials};
use dualtier_storage::LocalStore;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection settings, derived from [`EngineConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub local_dir: Option<PathBuf>,
    pub remote: Option<RemoteConfig>,
    pub namespace_base: String,
    pub database_base: String,
    pub tenant_code: Option<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl From<&EngineConfig> for ConnectionConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            local_dir: config.local_dir.clone(),
            remote: config.remote.clone(),
            namespace_base: config.namespace_base.clone(),
            database_base: config.database_base.clone(),
            tenant_code: config.tenant_code.clone(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: config.reconnect_base_delay(),
        }
    }
}

impl ConnectionConfig {
    fn namespace(&self, tenant: Option<&str>) -> String {
        tenant_scoped(&self.namespace_base, tenant)
    }

    fn database(&self, tenant: Option<&str>) -> String {
        tenant_scoped(&self.database_base, tenant)
    }
}

struct Inner {
    connector: Arc<dyn RemoteConnector>,
    state_tx: watch::Sender<ConnectionState>,
    recovered_tx: watch::Sender<u64>,
    config: RwLock<Option<ConnectionConfig>>,
    local: RwLock<Option<LocalStore>>,
    remote: RwLock<Option<Arc<dyn RemoteStore>>>,
    auth: RwLock<Option<AuthState>>,
    tenant: RwLock<Option<String>>,
    credentials: RwLock<Option<Credentials>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones share one set of handles.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (recovered_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                connector,
                state_tx,
                recovered_tx,
                config: RwLock::new(None),
                local: RwLock::new(None),
                remote: RwLock::new(None),
                auth: RwLock::new(None),
                tenant: RwLock::new(None),
                credentials: RwLock::new(None),
                reconnect: Mutex::new(None),
            }),
        }
    }

    // ── Accessors ──

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Bumped each time a reconnect completes, sign-in replay included.
    pub fn subscribe_recovered(&self) -> watch::Receiver<u64> {
        self.inner.recovered_tx.subscribe()
    }

    pub fn auth_state(&self) -> Option<AuthState> {
        read(&self.inner.auth).clone()
    }

    pub fn tenant(&self) -> Option<String> {
        read(&self.inner.tenant).clone()
    }

    pub fn config(&self) -> Option<ConnectionConfig> {
        read(&self.inner.config).clone()
    }

    /// The open local database.
    pub fn local(&self) -> EngineResult<LocalStore> {
        read(&self.inner.local)
            .clone()
            .ok_or(EngineError::NotConnected)
    }

    /// The remote handle, whatever the state.
    pub fn remote(&self) -> Option<Arc<dyn RemoteStore>> {
        read(&self.inner.remote).clone()
    }

    /// The remote handle while connected or authenticated.
    pub fn online_remote(&self) -> Option<Arc<dyn RemoteStore>> {
        if self.state().is_online() {
            self.remote()
        } else {
            None
        }
    }

    pub fn has_remote_config(&self) -> bool {
        read(&self.inner.config)
            .as_ref()
            .is_some_and(|c| c.remote.is_some())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.inner.state_tx.send_replace(next);
        if previous != next {
            debug!("connection state {previous} -> {next}");
        }
    }

    fn require_online(&self) -> EngineResult<()> {
        let state = self.state();
        if state.is_online() {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                expected: "connected or authenticated",
                actual: state,
            })
        }
    }

    // ── Lifecycle ──

    /// Open the local database and, if configured, the remote one.
    pub async fn connect(&self, config: ConnectionConfig) -> EngineResult<()> {
        self.teardown().await;
        self.set_state(ConnectionState::Connecting);

        let tenant = config.tenant_code.clone();
        *write(&self.inner.config) = Some(config.clone());
        *write(&self.inner.tenant) = tenant.clone();

        match self.open_handles(&config, tenant.as_deref()).await {
            Ok((local, remote)) => {
                *write(&self.inner.local) = Some(local);
                *write(&self.inner.remote) = remote;
                self.set_state(ConnectionState::Connected);
                info!(
                    "connected (tenant: {}, remote: {})",
                    tenant.as_deref().unwrap_or("-"),
                    config.remote.is_some()
                );
                Ok(())
            }
            Err(e) => {
                error!("connect failed: {e}");
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn open_handles(
        &self,
        config: &ConnectionConfig,
        tenant: Option<&str>,
    ) -> EngineResult<(LocalStore, Option<Arc<dyn RemoteStore>>)> {
        let local = open_local(config, tenant).await?;
        let remote = match &config.remote {
            Some(remote_config) => {
                let remote = self.inner.connector.connect(remote_config).await?;
                remote
                    .use_ns(&config.namespace(tenant), &config.database(tenant))
                    .await?;
                Some(remote)
            }
            None => None,
        };
        Ok((local, remote))
    }

    /// Point both tiers at the `<base>_<code>` databases of another tenant.
    /// The remote transport stays open. Authorization is dropped.
    pub async fn switch_tenant(&self, tenant_code: &str) -> EngineResult<()> {
        self.require_online()?;
        let config = self.config().ok_or(EngineError::NotConnected)?;
        let tenant = Some(tenant_code);

        let local = open_local(&config, tenant).await?;
        if let Some(remote) = self.remote() {
            remote
                .use_ns(&config.namespace(tenant), &config.database(tenant))
                .await?;
        }

        *write(&self.inner.local) = Some(local);
        *write(&self.inner.tenant) = Some(tenant_code.to_string());
        *write(&self.inner.auth) = None;
        *write(&self.inner.credentials) = None;
        if self.state() == ConnectionState::Authenticated {
            self.set_state(ConnectionState::Connected);
        }
        info!("switched to tenant {tenant_code}");
        Ok(())
    }

    /// Sign in on the remote and record the principal's permissions.
    pub async fn authenticate(&self, credentials: Credentials) -> EngineResult<AuthState> {
        self.require_online()?;
        let remote = self
            .remote()
            .ok_or_else(|| EngineError::Config("no remote database configured".to_string()))?;

        if let Some(code) = credentials.tenant_code.as_deref() {
            if self.tenant().as_deref() != Some(code) {
                self.switch_tenant(code).await?;
            }
        }

        let response = match remote.signin(&credentials).await {
            Ok(response) => response,
            Err(e) => {
                warn!("sign-in failed for {}: {e}", credentials.principal_id);
                self.set_state(ConnectionState::Error);
                return Err(match e {
                    EngineError::Auth(msg) => EngineError::Auth(msg),
                    other => EngineError::Auth(other.to_string()),
                });
            }
        };

        let auth = AuthState::from_signin(&credentials, self.tenant(), response);
        *write(&self.inner.auth) = Some(auth.clone());
        *write(&self.inner.credentials) = Some(credentials);
        self.set_state(ConnectionState::Authenticated);
        info!("authenticated {}", auth.principal_id);
        Ok(auth)
    }

    /// Close both tiers. Safe to call in any state.
    pub async fn disconnect(&self) {
        self.teardown().await;
        *write(&self.inner.config) = None;
        *write(&self.inner.tenant) = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn teardown(&self) {
        self.cancel_reconnect();
        let remote = write(&self.inner.remote).take();
        if let Some(remote) = remote {
            remote.close().await;
        }
        *write(&self.inner.local) = None;
        *write(&self.inner.auth) = None;
        *write(&self.inner.credentials) = None;
    }

    fn cancel_reconnect(&self) {
        let handle = self
            .inner
            .reconnect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    // ── Reconnection ──

    /// Report that the remote went away. Starts the reconnect loop when the
    /// manager was online; ignored otherwise.
    pub fn notify_remote_lost(&self) {
        if !self.state().is_online() || !self.has_remote_config() {
            return;
        }
        warn!("remote connection lost");
        self.set_state(ConnectionState::Error);

        let remote = write(&self.inner.remote).take();
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            if let Some(remote) = remote {
                remote.close().await;
            }
            manager.reconnect_loop().await;
        });

        let previous = self
            .inner
            .reconnect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn reconnect_loop(&self) {
        let Some(config) = self.config() else {
            return;
        };
        let max_attempts = config.max_reconnect_attempts;

        for attempt in 1..=max_attempts {
            let delay = config
                .reconnect_base_delay
                .saturating_mul(2u32.saturating_pow(attempt - 1));
            debug!("reconnect attempt {attempt}/{max_attempts} in {delay:?}");
            tokio::time::sleep(delay).await;

            self.set_state(ConnectionState::Connecting);
            match self.reopen_remote(&config).await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    info!("reconnected after {attempt} attempt(s)");
                    self.replay_signin().await;
                    if self.state().is_online() {
                        self.inner.recovered_tx.send_modify(|n| *n += 1);
                    }
                    return;
                }
                Err(e) => {
                    warn!("reconnect attempt {attempt} failed: {e}");
                    self.set_state(ConnectionState::Error);
                }
            }
        }
        error!("giving up reconnecting after {max_attempts} attempt(s)");
    }

    async fn reopen_remote(&self, config: &ConnectionConfig) -> EngineResult<()> {
        let remote_config = config
            .remote
            .as_ref()
            .ok_or_else(|| EngineError::Config("no remote database configured".to_string()))?;
        let tenant = self.tenant();
        let remote = self.inner.connector.connect(remote_config).await?;
        remote
            .use_ns(
                &config.namespace(tenant.as_deref()),
                &config.database(tenant.as_deref()),
            )
            .await?;
        *write(&self.inner.remote) = Some(remote);
        Ok(())
    }

    async fn replay_signin(&self) {
        let credentials = read(&self.inner.credentials).clone();
        let (Some(credentials), Some(remote)) = (credentials, self.remote()) else {
            return;
        };
        match remote.signin(&credentials).await {
            Ok(response) => {
                let auth = AuthState::from_signin(&credentials, self.tenant(), response);
                *write(&self.inner.auth) = Some(auth);
                self.set_state(ConnectionState::Authenticated);
            }
            Err(e) => {
                warn!("sign-in replay failed: {e}");
                *write(&self.inner.auth) = None;
                self.set_state(ConnectionState::Error);
            }
        }
    }
}

async fn open_local(config: &ConnectionConfig, tenant: Option<&str>) -> EngineResult<LocalStore> {
    let dir = config.local_dir.clone();
    let name = config.database(tenant);
    let store =
        tokio::task::spawn_blocking(move || LocalStore::open_named(dir.as_deref(), &name)).await??;
    Ok(store)
}
