//! Cache metadata bookkeeping (`_cache_metadata`).

use super::helpers::{from_millis, to_millis};
use super::LocalStore;
use crate::error::{StorageError, StorageResult};
use crate::types::{CacheMetadata, CacheType};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

const METADATA_COLUMNS: &str =
    "table_name, cache_type, live_query_uuid, record_count, last_sync_time, expires_at, is_active";

impl LocalStore {
    /// Metadata for one cached table.
    pub fn get_cache_metadata(&self, table: &str) -> StorageResult<Option<CacheMetadata>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {METADATA_COLUMNS} FROM _cache_metadata WHERE table_name = ?1"
        ))?;
        let mut rows = stmt.query(params![table])?;
        match rows.next()? {
            Some(row) => Ok(Some(metadata_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// All metadata rows, ordered by table name.
    pub fn list_cache_metadata(&self) -> StorageResult<Vec<CacheMetadata>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {METADATA_COLUMNS} FROM _cache_metadata ORDER BY table_name"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(metadata_from_row(row)?);
        }
        Ok(out)
    }

    /// Insert or replace the metadata row for `meta.table_name`.
    /// `table_name` is the primary key, so a table never has two rows.
    pub fn save_cache_metadata(&self, meta: &CacheMetadata) -> StorageResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            r#"INSERT OR REPLACE INTO _cache_metadata
               (table_name, cache_type, live_query_uuid, record_count, last_sync_time, expires_at, is_active)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                meta.table_name,
                meta.cache_type.as_str(),
                meta.live_query_uuid,
                meta.record_count,
                to_millis(meta.last_sync_time),
                meta.expires_at.map(to_millis),
                meta.is_active,
            ],
        )?;
        Ok(())
    }

    /// Record a sync: new record count and sync time. No-op without a row.
    pub fn record_cache_sync(
        &self,
        table: &str,
        record_count: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE _cache_metadata SET record_count = ?2, last_sync_time = ?3 WHERE table_name = ?1",
            params![table, record_count, to_millis(at)],
        )?;
        Ok(changed > 0)
    }

    /// Mark a cached table unusable for reads until it is repopulated.
    pub fn deactivate_cache(&self, table: &str) -> StorageResult<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE _cache_metadata SET is_active = 0 WHERE table_name = ?1",
            params![table],
        )?;
        Ok(changed > 0)
    }

    /// Remove the metadata row. Returns true if one existed.
    pub fn delete_cache_metadata(&self, table: &str) -> StorageResult<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "DELETE FROM _cache_metadata WHERE table_name = ?1",
            params![table],
        )?;
        Ok(changed > 0)
    }
}

fn metadata_from_row(row: &Row<'_>) -> StorageResult<CacheMetadata> {
    let cache_type: String = row.get(1)?;
    Ok(CacheMetadata {
        table_name: row.get(0)?,
        cache_type: cache_type
            .parse::<CacheType>()
            .map_err(StorageError::InvalidRecord)?,
        live_query_uuid: row.get(2)?,
        record_count: row.get(3)?,
        last_sync_time: from_millis(row.get(4)?),
        expires_at: row.get::<_, Option<i64>>(5)?.map(from_millis),
        is_active: row.get(6)?,
    })
}
