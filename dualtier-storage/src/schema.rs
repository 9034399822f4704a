//! DDL for the bookkeeping tables every local database carries.

use crate::error::StorageResult;
use rusqlite::Connection;

/// Cache metadata table name.
pub const CACHE_METADATA_TABLE: &str = "_cache_metadata";

/// Offline operation journal table name.
pub const OFFLINE_JOURNAL_TABLE: &str = "_offline_operations";

/// One row per cached table.
const CACHE_METADATA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS _cache_metadata (
    table_name TEXT PRIMARY KEY,
    cache_type TEXT NOT NULL,
    live_query_uuid TEXT,
    record_count INTEGER NOT NULL DEFAULT 0,
    last_sync_time INTEGER NOT NULL,
    expires_at INTEGER,
    is_active INTEGER NOT NULL DEFAULT 1
);
"#;

/// Journal of queued offline mutations.
const OFFLINE_JOURNAL_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS _offline_operations (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    table_name TEXT NOT NULL,
    record_id TEXT,
    payload TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    status TEXT NOT NULL,
    tenant_code TEXT,
    last_error TEXT,
    queued_at INTEGER NOT NULL
);
"#;

/// Initialize the bookkeeping tables.
pub fn initialize_local_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(CACHE_METADATA_DDL)?;
    conn.execute_batch(OFFLINE_JOURNAL_DDL)?;
    Ok(())
}

/// Tables managed by the store itself; never exposed as cache tables.
pub fn is_internal_table(name: &str) -> bool {
    name.starts_with('_') || name.starts_with("sqlite_")
}
