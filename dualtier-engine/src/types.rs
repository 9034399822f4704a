//! Shared types for the dual-tier engine.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use dualtier_storage::JournalEntry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ── Connection ──

/// Lifecycle of the engine's database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Error => "error",
        }
    }

    /// Connected or authenticated: the remote tier is usable.
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Authenticated
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the identity provider hands us: a principal, a token, a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub principal_id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_code: Option<String>,
}

/// Remote sign-in result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SigninResponse {
    /// Session token to use instead of the identity token, if issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub roles: Vec<String>,
    pub menus: Vec<String>,
    pub operations: Vec<String>,
}

/// Authorization snapshot of the signed-in principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub principal_id: String,
    pub tenant_code: Option<String>,
    pub roles: BTreeSet<String>,
    pub menus: BTreeSet<String>,
    pub operations: BTreeSet<String>,
    pub synced_at: DateTime<Utc>,
}

impl AuthState {
    pub fn from_signin(
        credentials: &Credentials,
        tenant_code: Option<String>,
        response: SigninResponse,
    ) -> Self {
        Self {
            principal_id: credentials.principal_id.clone(),
            tenant_code,
            roles: response.roles.into_iter().collect(),
            menus: response.menus.into_iter().collect(),
            operations: response.operations.into_iter().collect(),
            synced_at: Utc::now(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn can_access_menu(&self, menu: &str) -> bool {
        self.menus.contains(menu)
    }

    pub fn can_perform(&self, operation: &str) -> bool {
        self.operations.contains(operation)
    }
}

// ── Routing ──

/// Statement class. Ordered by precedence: a batch takes the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Read,
    Write,
    Schema,
}

/// Static analysis of a statement batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnalysis {
    pub tables: BTreeSet<String>,
    pub kind: QueryKind,
    pub statement_count: usize,
    /// A table reference could only be resolved at runtime.
    pub dynamic: bool,
}

impl QueryAnalysis {
    /// Analysis of a single-table record operation.
    pub fn for_table(table: &str, kind: QueryKind) -> Self {
        Self {
            tables: BTreeSet::from([table.to_string()]),
            kind,
            statement_count: 1,
            dynamic: false,
        }
    }
}

/// Where a call executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    LocalOnly,
    RemoteOnly,
    Hybrid,
}

impl fmt::Display for RouteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouteStrategy::LocalOnly => "local-only",
            RouteStrategy::RemoteOnly => "remote-only",
            RouteStrategy::Hybrid => "hybrid",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub strategy: RouteStrategy,
    pub rationale: String,
}

impl RouteDecision {
    pub fn new(strategy: RouteStrategy, rationale: impl Into<String>) -> Self {
        Self {
            strategy,
            rationale: rationale.into(),
        }
    }
}

// ── Execution ──

/// Which tier produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Local,
    Remote,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub data: Value,
    pub source: Source,
    pub execution_time_ms: u64,
    pub cache_hit: bool,
    /// Served from the local cache because the remote failed.
    pub stale: bool,
    pub route: RouteDecision,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecuteOptions {
    /// Serve cached rows when the remote fails on a hybrid read.
    pub allow_stale: bool,
}

/// One data call, decoded from an RPC method and its positional params.
///
/// Record targets are written `table` or `table:id`.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    Query {
        sql: String,
        vars: Map<String, Value>,
    },
    Select {
        table: String,
        id: Option<String>,
    },
    Create {
        table: String,
        id: Option<String>,
        data: Value,
    },
    Update {
        table: String,
        id: String,
        data: Value,
    },
    Merge {
        table: String,
        id: String,
        data: Value,
    },
    Delete {
        table: String,
        id: String,
    },
}

impl RpcCall {
    /// Decode `query [sql, vars?]`, `select [target]`, `create [target, data]`,
    /// `update|merge [target, data]` and `delete [target]`.
    pub fn from_method(method: &str, params: &Value) -> EngineResult<Self> {
        let args = params.as_array().map(Vec::as_slice).unwrap_or_default();
        let str_arg = |idx: usize, name: &str| -> EngineResult<String> {
            args.get(idx)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    EngineError::InvalidParams(format!("{method}: missing string param `{name}`"))
                })
        };
        let data_arg = |idx: usize| -> EngineResult<Value> {
            match args.get(idx) {
                Some(v @ Value::Object(_)) => Ok(v.clone()),
                _ => Err(EngineError::InvalidParams(format!(
                    "{method}: `data` must be an object"
                ))),
            }
        };
        let record_target = |idx: usize| -> EngineResult<(String, String)> {
            let (table, id) = split_target(&str_arg(idx, "target")?);
            let id = id.ok_or_else(|| {
                EngineError::InvalidParams(format!("{method}: target must be `table:id`"))
            })?;
            Ok((table, id))
        };

        match method {
            "query" => {
                let vars = match args.get(1) {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(vars)) => vars.clone(),
                    Some(_) => {
                        return Err(EngineError::InvalidParams(
                            "query: `vars` must be an object".to_string(),
                        ));
                    }
                };
                Ok(RpcCall::Query {
                    sql: str_arg(0, "sql")?,
                    vars,
                })
            }
            "select" => {
                let (table, id) = split_target(&str_arg(0, "target")?);
                Ok(RpcCall::Select { table, id })
            }
            "create" => {
                let (table, id) = split_target(&str_arg(0, "target")?);
                Ok(RpcCall::Create {
                    table,
                    id,
                    data: data_arg(1)?,
                })
            }
            "update" => {
                let (table, id) = record_target(0)?;
                Ok(RpcCall::Update {
                    table,
                    id,
                    data: data_arg(1)?,
                })
            }
            "merge" => {
                let (table, id) = record_target(0)?;
                Ok(RpcCall::Merge {
                    table,
                    id,
                    data: data_arg(1)?,
                })
            }
            "delete" => {
                let (table, id) = record_target(0)?;
                Ok(RpcCall::Delete { table, id })
            }
            other => Err(EngineError::UnknownMethod(other.to_string())),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::Query { .. } => "query",
            RpcCall::Select { .. } => "select",
            RpcCall::Create { .. } => "create",
            RpcCall::Update { .. } => "update",
            RpcCall::Merge { .. } => "merge",
            RpcCall::Delete { .. } => "delete",
        }
    }

    /// Table of a record call; `None` for raw queries.
    pub fn table(&self) -> Option<&str> {
        match self {
            RpcCall::Query { .. } => None,
            RpcCall::Select { table, .. }
            | RpcCall::Create { table, .. }
            | RpcCall::Update { table, .. }
            | RpcCall::Merge { table, .. }
            | RpcCall::Delete { table, .. } => Some(table),
        }
    }

    /// Record id targeted by the call, when known up front.
    pub fn record_id(&self) -> Option<&str> {
        match self {
            RpcCall::Query { .. } => None,
            RpcCall::Select { id, .. } => id.as_deref(),
            RpcCall::Create { id, data, .. } => {
                id.as_deref().or_else(|| data.get("id").and_then(Value::as_str))
            }
            RpcCall::Update { id, .. } | RpcCall::Merge { id, .. } | RpcCall::Delete { id, .. } => {
                Some(id)
            }
        }
    }

    /// Record mutation that can be replayed later.
    pub fn to_offline_operation(&self) -> Option<NewOperation> {
        let (kind, table, payload) = match self {
            RpcCall::Query { .. } | RpcCall::Select { .. } => return None,
            RpcCall::Create { table, data, .. } => (OperationKind::Create, table, data.clone()),
            RpcCall::Update { table, data, .. } => (OperationKind::Update, table, data.clone()),
            RpcCall::Merge { table, data, .. } => (OperationKind::Merge, table, data.clone()),
            RpcCall::Delete { table, .. } => (OperationKind::Delete, table, Value::Null),
        };
        Some(NewOperation {
            kind,
            table: table.clone(),
            record_id: self.record_id().map(str::to_string),
            payload,
            max_retries: None,
        })
    }
}

/// Split `table:id` into its parts. A bare name has no id.
pub fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once(':') {
        Some((table, id)) if !id.is_empty() => (table.to_string(), Some(id.to_string())),
        Some((table, _)) => (table.to_string(), None),
        None => (target.to_string(), None),
    }
}

// ── Live queries ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiveAction {
    Create,
    Update,
    Delete,
}

/// One change pushed by a remote live query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveNotification {
    pub subscription_id: Uuid,
    pub action: LiveAction,
    pub result: Value,
}

// ── Offline queue ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Merge,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Merge => "merge",
            OperationKind::Delete => "delete",
        }
    }

    /// Everything but create addresses an existing record.
    pub fn needs_record_id(&self) -> bool {
        !matches!(self, OperationKind::Create)
    }
}

impl FromStr for OperationKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "merge" => Ok(OperationKind::Merge),
            "delete" => Ok(OperationKind::Delete),
            other => Err(EngineError::InvalidParams(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in_flight",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    /// Completed and failed operations never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

impl FromStr for OperationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_flight" => Ok(OperationStatus::InFlight),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(EngineError::InvalidParams(format!(
                "unknown operation status: {other}"
            ))),
        }
    }
}

/// A mutation captured while the remote was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineOperation {
    pub id: String,
    pub kind: OperationKind,
    pub table: String,
    pub record_id: Option<String>,
    pub payload: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    pub tenant_code: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl OfflineOperation {
    /// The data call that replays this operation.
    pub fn to_call(&self) -> RpcCall {
        let table = self.table.clone();
        let id = self.record_id.clone().unwrap_or_default();
        match self.kind {
            OperationKind::Create => RpcCall::Create {
                table,
                id: self.record_id.clone(),
                data: self.payload.clone(),
            },
            OperationKind::Update => RpcCall::Update {
                table,
                id,
                data: self.payload.clone(),
            },
            OperationKind::Merge => RpcCall::Merge {
                table,
                id,
                data: self.payload.clone(),
            },
            OperationKind::Delete => RpcCall::Delete { table, id },
        }
    }

    pub fn to_journal_entry(&self) -> JournalEntry {
        JournalEntry {
            id: self.id.clone(),
            kind: self.kind.as_str().to_string(),
            table_name: self.table.clone(),
            record_id: self.record_id.clone(),
            payload: self.payload.clone(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            status: self.status.as_str().to_string(),
            tenant_code: self.tenant_code.clone(),
            last_error: self.last_error.clone(),
            queued_at: self.queued_at,
        }
    }
}

impl TryFrom<JournalEntry> for OfflineOperation {
    type Error = EngineError;

    fn try_from(entry: JournalEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: entry.kind.parse()?,
            status: entry.status.parse()?,
            id: entry.id,
            table: entry.table_name,
            record_id: entry.record_id,
            payload: entry.payload,
            retry_count: entry.retry_count,
            max_retries: entry.max_retries,
            tenant_code: entry.tenant_code,
            queued_at: entry.queued_at,
            last_error: entry.last_error,
        })
    }
}

/// Input of `queue_offline_operation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    pub kind: OperationKind,
    pub table: String,
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Falls back to the configured default.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewOperation {
    /// Reject operations that could never replay.
    pub fn validate(&self) -> EngineResult<()> {
        if self.table.is_empty() {
            return Err(EngineError::InvalidParams("operation needs a table".to_string()));
        }
        let has_id = self.record_id.as_deref().is_some_and(|id| !id.is_empty());
        if self.kind.needs_record_id() && !has_id {
            return Err(EngineError::InvalidParams(format!(
                "{} operation needs a recordId",
                self.kind.as_str()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// The cycle did not run (offline, or another cycle in progress).
    pub skipped: bool,
    pub attempted: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}
