//! Embedded SQLite store for dualtier.
//!
//! The local tier of the engine. It holds:
//! - cached copies of remote tables, one SQLite table per remote table,
//!   with a column per top-level record field (added on demand)
//! - tables that only ever live locally
//! - the `_cache_metadata` bookkeeping table
//! - the `_offline_operations` journal
//!
//! Records are JSON objects keyed by a string `id`. Nested values are
//! stored as JSON text and decoded on the way out.

mod error;
mod schema;
mod store;
mod types;

pub use error::{StorageError, StorageResult};
pub use schema::{
    initialize_local_schema, is_internal_table, CACHE_METADATA_TABLE, OFFLINE_JOURNAL_TABLE,
};
pub use store::LocalStore;
pub use types::{CacheMetadata, CacheType, JournalEntry};

/// File extension for tenant-scoped database files.
pub const DB_FILE_EXTENSION: &str = "sqlite3";

/// Open a SQLite connection tuned for the engine's access pattern.
///
/// WAL journaling lets the mirror tasks write while reads are served;
/// `busy_timeout` absorbs short lock contention between them.
pub fn open_local_db(path: &std::path::Path) -> StorageResult<rusqlite::Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = rusqlite::Connection::open(path)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!("local database {} stays in {mode} journal mode", path.display());
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}
