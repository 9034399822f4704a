//! Offline operation journal (`_offline_operations`).

use super::helpers::{from_millis, to_millis};
use super::LocalStore;
use crate::error::StorageResult;
use crate::types::JournalEntry;
use rusqlite::{params, Row};

impl LocalStore {
    /// Insert or replace a journal entry.
    pub fn save_journal_entry(&self, entry: &JournalEntry) -> StorageResult<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        let conn = self.lock_conn();
        conn.execute(
            r#"INSERT OR REPLACE INTO _offline_operations
               (id, kind, table_name, record_id, payload, retry_count, max_retries,
                status, tenant_code, last_error, queued_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                entry.id,
                entry.kind,
                entry.table_name,
                entry.record_id,
                payload,
                entry.retry_count,
                entry.max_retries,
                entry.status,
                entry.tenant_code,
                entry.last_error,
                to_millis(entry.queued_at),
            ],
        )?;
        Ok(())
    }

    /// Update status bookkeeping of an entry. Returns false if it is unknown.
    pub fn update_journal_status(
        &self,
        id: &str,
        status: &str,
        retry_count: u32,
        last_error: Option<&str>,
    ) -> StorageResult<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE _offline_operations SET status = ?2, retry_count = ?3, last_error = ?4 WHERE id = ?1",
            params![id, status, retry_count, last_error],
        )?;
        Ok(changed > 0)
    }

    /// Delete entries by id. Returns how many were removed.
    pub fn delete_journal_entries(&self, ids: &[String]) -> StorageResult<usize> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM _offline_operations WHERE id = ?1")?;
            for id in ids {
                removed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// All journal entries in enqueue order.
    pub fn load_journal(&self) -> StorageResult<Vec<JournalEntry>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            r#"SELECT id, kind, table_name, record_id, payload, retry_count, max_retries,
                      status, tenant_code, last_error, queued_at
               FROM _offline_operations ORDER BY queued_at, rowid"#,
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(entry_from_row(row)?);
        }
        Ok(out)
    }
}

fn entry_from_row(row: &Row<'_>) -> StorageResult<JournalEntry> {
    let payload: String = row.get(4)?;
    Ok(JournalEntry {
        id: row.get(0)?,
        kind: row.get(1)?,
        table_name: row.get(2)?,
        record_id: row.get(3)?,
        payload: serde_json::from_str(&payload)?,
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        status: row.get(7)?,
        tenant_code: row.get(8)?,
        last_error: row.get(9)?,
        queued_at: from_millis(row.get(10)?),
    })
}
