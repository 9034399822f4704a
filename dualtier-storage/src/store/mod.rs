//! Core local store: a thread-safe SQLite wrapper with modular operations.

pub(crate) mod helpers;
mod journal;
mod metadata;
mod query;
mod records;

use crate::error::StorageResult;
use crate::schema::{initialize_local_schema, is_internal_table};
use helpers::validate_identifier;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-safe handle to one embedded database.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    name: String,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_local_db(path)?;
        initialize_local_schema(&conn)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local".to_string());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            name,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing and disposable caches).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::in_memory_named("memory")
    }

    /// Open the database called `name`, as `<dir>/<name>.sqlite3` when a
    /// directory is given, otherwise as a fresh in-memory database.
    pub fn open_named(dir: Option<&Path>, name: &str) -> StorageResult<Self> {
        validate_identifier(name)?;
        match dir {
            Some(dir) => {
                let path = dir.join(format!("{name}.{}", crate::DB_FILE_EXTENSION));
                Self::open(&path)
            }
            None => Self::in_memory_named(name),
        }
    }

    fn in_memory_named(name: &str) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_local_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            name: name.to_string(),
            path: None,
        })
    }

    /// Database name (file stem, or the in-memory label).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquire the connection lock, recovering from poison if a panic
    /// occurred while the lock was held.
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("[LocalStore] recovering from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// User-visible tables, excluding bookkeeping tables.
    pub fn list_tables(&self) -> StorageResult<Vec<String>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter(|name| !is_internal_table(name))
            .collect();
        Ok(names)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}
