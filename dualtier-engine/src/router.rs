//! Query router: static statement analysis and per-call tier selection.

use crate::config::{CacheStrategy, EngineConfig, TableStrategy};
use crate::connection::ConnectionManager;
use crate::error::EngineResult;
use crate::types::{QueryAnalysis, QueryKind, RouteDecision, RouteStrategy, RpcCall, split_target};
use chrono::Utc;
use regex_lite::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, LazyLock};

/// String literals and comments. Matched together so a `--` inside a
/// literal is not taken for a comment.
static LITERALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'(?:[^']|'')*'|--[^\n]*|/\*[\s\S]*?\*/").expect("literal pattern is valid")
});

/// Quoted identifiers, `$params`, `table:id` references, bare words and
/// single punctuation characters.
static TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""[^"]*"|`[^`]*`|\$?[A-Za-z_][A-Za-z0-9_]*(?::[A-Za-z0-9_]+)?|\S"#)
        .expect("token pattern is valid")
});

/// Keywords followed by a table name.
const TABLE_KEYWORDS: &[&str] = &[
    "FROM", "JOIN", "INTO", "UPDATE", "UPSERT", "DELETE", "CREATE", "TABLE",
];

/// Words allowed between a table keyword and the table name.
const MODIFIERS: &[&str] = &[
    "ONLY", "IF", "NOT", "EXISTS", "TABLE", "FROM", "TEMP", "TEMPORARY", "OR", "REPLACE",
    "IGNORE", "INTO",
];

/// Words that end a FROM list or cannot be an alias.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "OFFSET", "HAVING", "JOIN", "INNER", "LEFT", "RIGHT",
    "FULL", "OUTER", "CROSS", "NATURAL", "ON", "USING", "UNION", "EXCEPT", "INTERSECT", "SET",
    "VALUES", "RETURNING", "RETURN", "FETCH", "SPLIT", "WINDOW", "CONTENT", "MERGE", "SELECT",
    "INDEX", "VIEW", "TRIGGER", "UNIQUE", "VIRTUAL",
];

const READ_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "EXPLAIN", "SHOW", "INFO", "VALUES", "RETURN", "LIVE",
];
const SCHEMA_KEYWORDS: &[&str] = &["DEFINE", "REMOVE", "ALTER", "DROP"];
const SCHEMA_OBJECTS: &[&str] = &["TABLE", "INDEX", "VIEW", "TRIGGER", "UNIQUE", "VIRTUAL"];
const TRANSACTION_KEYWORDS: &[&str] = &["BEGIN", "COMMIT", "CANCEL", "ROLLBACK", "END"];

fn is_one_of(token: &str, words: &[&str]) -> bool {
    words.iter().any(|w| token.eq_ignore_ascii_case(w))
}

/// Analyze a statement batch. Pure: same input, same output.
pub fn analyze_query(sql: &str, params: &Map<String, Value>) -> QueryAnalysis {
    let cleaned = LITERALS.replace_all(sql, |caps: &regex_lite::Captures<'_>| {
        if caps[0].starts_with('\'') {
            "''".to_string()
        } else {
            " ".to_string()
        }
    });

    let mut tables = BTreeSet::new();
    let mut kind = None::<QueryKind>;
    let mut statement_count = 0;
    let mut dynamic = false;

    for statement in cleaned.split(';') {
        let tokens: Vec<&str> = TOKENS.find_iter(statement).map(|m| m.as_str()).collect();
        let Some(first) = tokens.first() else {
            continue;
        };
        statement_count += 1;

        if let Some(statement_kind) = classify(first, tokens.get(1).copied()) {
            kind = Some(kind.map_or(statement_kind, |k| k.max(statement_kind)));
        }
        extract_tables(&tokens, params, &mut tables, &mut dynamic);
    }

    QueryAnalysis {
        tables,
        kind: kind.unwrap_or(QueryKind::Read),
        statement_count,
        dynamic,
    }
}

/// Kind of a statement from its leading keyword. Transaction control has
/// none; unknown statements count as writes.
fn classify(first: &str, second: Option<&str>) -> Option<QueryKind> {
    if is_one_of(first, TRANSACTION_KEYWORDS) {
        None
    } else if is_one_of(first, READ_KEYWORDS) {
        Some(QueryKind::Read)
    } else if is_one_of(first, SCHEMA_KEYWORDS) {
        Some(QueryKind::Schema)
    } else if first.eq_ignore_ascii_case("CREATE") {
        match second {
            Some(next) if is_one_of(next, SCHEMA_OBJECTS) || is_one_of(next, &["TEMP", "TEMPORARY"]) => {
                Some(QueryKind::Schema)
            }
            _ => Some(QueryKind::Write),
        }
    } else {
        // INSERT, UPDATE, UPSERT, DELETE, RELATE and anything unrecognized.
        Some(QueryKind::Write)
    }
}

fn extract_tables(
    tokens: &[&str],
    params: &Map<String, Value>,
    tables: &mut BTreeSet<String>,
    dynamic: &mut bool,
) {
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        i += 1;
        if !is_one_of(token, TABLE_KEYWORDS) {
            continue;
        }
        let is_from = token.eq_ignore_ascii_case("FROM");
        let allows_call = is_from || token.eq_ignore_ascii_case("JOIN");

        while i < tokens.len() && is_one_of(tokens[i], MODIFIERS) {
            i += 1;
        }

        loop {
            let Some(candidate) = tokens.get(i) else {
                break;
            };
            // Subquery, table function or punctuation: no table here.
            if !starts_like_name(candidate) || (allows_call && tokens.get(i + 1) == Some(&"(")) {
                break;
            }
            if is_one_of(candidate, CLAUSE_KEYWORDS) {
                break;
            }
            i += 1;
            match resolve_table(candidate, params) {
                Some(table) => {
                    tables.insert(table);
                }
                None => *dynamic = true,
            }

            if !is_from {
                break;
            }
            // FROM a [AS] x, b ...
            if tokens.get(i).is_some_and(|t| t.eq_ignore_ascii_case("AS")) {
                i += 2;
            } else if tokens
                .get(i)
                .is_some_and(|t| is_bare_word(t) && !is_one_of(t, CLAUSE_KEYWORDS))
            {
                i += 1;
            }
            if tokens.get(i) == Some(&",") {
                i += 1;
            } else {
                break;
            }
        }
    }
}

fn starts_like_name(token: &str) -> bool {
    token
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '_' | '"' | '`' | '$'))
}

fn is_bare_word(token: &str) -> bool {
    token
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && !token.contains(':')
}

/// Table name behind a token. `None` when it is a parameter the caller
/// did not bind to a string.
fn resolve_table(token: &str, params: &Map<String, Value>) -> Option<String> {
    if let Some(name) = token.strip_prefix('$') {
        let (name, _) = split_target(name);
        return params
            .get(&name)
            .and_then(Value::as_str)
            .map(|target| split_target(target).0)
            .filter(|table| !table.is_empty());
    }
    let unquoted = token.trim_matches(|c| c == '"' || c == '`');
    Some(split_target(unquoted).0)
}

/// Decides which tier serves each call.
#[derive(Clone)]
pub struct QueryRouter {
    config: Arc<EngineConfig>,
    connection: ConnectionManager,
}

impl QueryRouter {
    pub fn new(config: Arc<EngineConfig>, connection: ConnectionManager) -> Self {
        Self { config, connection }
    }

    pub fn analyze_query(&self, sql: &str, params: &Map<String, Value>) -> QueryAnalysis {
        analyze_query(sql, params)
    }

    /// Analysis of any data call. Record calls address exactly one table.
    pub fn analyze_call(&self, call: &RpcCall) -> QueryAnalysis {
        match call {
            RpcCall::Query { sql, vars } => analyze_query(sql, vars),
            RpcCall::Select { table, .. } => QueryAnalysis::for_table(table, QueryKind::Read),
            RpcCall::Create { table, .. }
            | RpcCall::Update { table, .. }
            | RpcCall::Merge { table, .. }
            | RpcCall::Delete { table, .. } => QueryAnalysis::for_table(table, QueryKind::Write),
        }
    }

    pub fn table_config(&self, table: &str) -> TableStrategy {
        self.config.table(table)
    }

    pub fn strategy_for(&self, table: &str) -> CacheStrategy {
        self.config.strategy_for(table)
    }

    pub async fn route_query(
        &self,
        sql: &str,
        params: &Map<String, Value>,
    ) -> EngineResult<RouteDecision> {
        self.route(&analyze_query(sql, params)).await
    }

    pub async fn route_call(&self, call: &RpcCall) -> EngineResult<(QueryAnalysis, RouteDecision)> {
        let analysis = self.analyze_call(call);
        let decision = self.route(&analysis).await?;
        Ok((analysis, decision))
    }

    /// Route an analyzed call, looking up which of its tables are cached.
    pub async fn route(&self, analysis: &QueryAnalysis) -> EngineResult<RouteDecision> {
        if !self.connection.has_remote_config() {
            return Ok(RouteDecision::new(
                RouteStrategy::LocalOnly,
                "no remote database configured",
            ));
        }
        let cached = self.cached_tables(&analysis.tables).await?;
        Ok(self.decide(analysis, &cached))
    }

    /// Tables of `tables` with an active, unexpired cache.
    pub async fn cached_tables(&self, tables: &BTreeSet<String>) -> EngineResult<HashSet<String>> {
        let Ok(store) = self.connection.local() else {
            return Ok(HashSet::new());
        };
        let tables: Vec<String> = tables.iter().cloned().collect();
        let cached = tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            let mut cached = HashSet::new();
            for table in tables {
                if store
                    .get_cache_metadata(&table)?
                    .is_some_and(|meta| meta.is_fresh_at(now))
                {
                    cached.insert(table);
                }
            }
            Ok::<_, dualtier_storage::StorageError>(cached)
        })
        .await??;
        Ok(cached)
    }

    pub async fn is_table_cached(&self, table: &str) -> EngineResult<bool> {
        let tables = BTreeSet::from([table.to_string()]);
        Ok(!self.cached_tables(&tables).await?.is_empty())
    }

    pub fn get_cacheable_tables(&self) -> Vec<String> {
        self.config.cacheable_tables()
    }

    pub fn preload_tables(&self) -> Vec<String> {
        self.config.preload_tables()
    }

    /// Combine per-table strategies into one route. `cached` holds the
    /// tables whose local cache may serve reads.
    pub fn decide(&self, analysis: &QueryAnalysis, cached: &HashSet<String>) -> RouteDecision {
        use RouteStrategy::*;

        if analysis.dynamic {
            return RouteDecision::new(RemoteOnly, "table resolved at runtime");
        }
        if analysis.tables.is_empty() {
            return match analysis.kind {
                QueryKind::Read => RouteDecision::new(LocalOnly, "no table referenced"),
                _ => RouteDecision::new(RemoteOnly, "statement without table goes to the remote"),
            };
        }

        let strategies: Vec<(&String, CacheStrategy)> = analysis
            .tables
            .iter()
            .map(|t| (t, self.strategy_for(t)))
            .collect();
        let all = |pred: &dyn Fn(&String, CacheStrategy) -> bool| {
            strategies.iter().all(|(t, s)| pred(*t, *s))
        };

        if let Some((table, _)) = strategies
            .iter()
            .find(|(_, s)| *s == CacheStrategy::RemoteOnly)
        {
            return RouteDecision::new(RemoteOnly, format!("{table} is REMOTE_ONLY"));
        }
        if all(&|_, s| s == CacheStrategy::LocalOnly) {
            return RouteDecision::new(LocalOnly, "all tables are LOCAL_ONLY");
        }

        match analysis.kind {
            QueryKind::Schema => RouteDecision::new(RemoteOnly, "schema statement"),
            QueryKind::Write => {
                let touches_hybrid = strategies.iter().any(|(_, s)| *s == CacheStrategy::Hybrid);
                let touches_local = strategies.iter().any(|(_, s)| *s == CacheStrategy::LocalOnly);
                if touches_hybrid {
                    RouteDecision::new(Hybrid, "write touches a HYBRID table")
                } else if touches_local {
                    RouteDecision::new(Hybrid, "write mixes local-only and remote tables")
                } else {
                    RouteDecision::new(RemoteOnly, "write to remote source of truth")
                }
            }
            QueryKind::Read => {
                if all(&|t, s| {
                    s == CacheStrategy::LocalOnly
                        || (matches!(s, CacheStrategy::LocalFirst | CacheStrategy::Hybrid)
                            && cached.contains(t))
                }) {
                    RouteDecision::new(LocalOnly, "all tables served from local cache")
                } else if all(&|_, s| s == CacheStrategy::RemoteFirst) {
                    RouteDecision::new(RemoteOnly, "REMOTE_FIRST read")
                } else {
                    RouteDecision::new(Hybrid, "cache miss or mixed table set")
                }
            }
        }
    }
}
