//! Record operations: upsert, merge, delete, select, bulk replace.

use super::helpers::{
    ensure_columns, ensure_table, json_to_sql, quote_ident, record_id, row_to_object,
    table_exists,
};
use super::LocalStore;
use crate::error::{StorageError, StorageResult};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::{Map, Value};

impl LocalStore {
    /// Insert or fully replace a record. Fields absent from `record` are
    /// cleared on the stored row.
    pub fn upsert_record(&self, table: &str, record: &Value) -> StorageResult<Value> {
        let object = as_object(record)?;
        let conn = self.lock_conn();
        upsert_on(&conn, table, object)?;
        Ok(record.clone())
    }

    /// Apply a shallow JSON merge patch to a record, creating it if missing.
    /// `null` values in the patch remove the field.
    pub fn merge_record(&self, table: &str, id: &str, patch: &Value) -> StorageResult<Value> {
        let patch = as_object(patch)?;
        let conn = self.lock_conn();

        let mut merged = match get_on(&conn, table, id)? {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        for (key, value) in patch {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged.insert("id".to_string(), Value::String(id.to_string()));

        upsert_on(&conn, table, &merged)?;
        Ok(Value::Object(merged))
    }

    /// Delete a record, returning it if it existed.
    pub fn delete_record(&self, table: &str, id: &str) -> StorageResult<Option<Value>> {
        let conn = self.lock_conn();
        let previous = get_on(&conn, table, id)?;
        if previous.is_some() {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", quote_ident(table)?),
                params![id],
            )?;
        }
        Ok(previous)
    }

    /// Fetch one record by id.
    pub fn get_record(&self, table: &str, id: &str) -> StorageResult<Option<Value>> {
        let conn = self.lock_conn();
        get_on(&conn, table, id)
    }

    /// Select all records of a table, or the one matching `id`.
    /// A table that does not exist yet yields no records.
    pub fn select_records(&self, table: &str, id: Option<&str>) -> StorageResult<Vec<Value>> {
        let conn = self.lock_conn();
        if !table_exists(&conn, table)? {
            return Ok(Vec::new());
        }
        let quoted = quote_ident(table)?;
        match id {
            Some(id) => Ok(get_on(&conn, table, id)?.into_iter().collect()),
            None => {
                let mut stmt = conn.prepare(&format!("SELECT * FROM {quoted} ORDER BY rowid"))?;
                let columns: Vec<String> =
                    stmt.column_names().into_iter().map(String::from).collect();
                let rows = stmt
                    .query_map([], |row| row_to_object(row, &columns, true))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            }
        }
    }

    /// Replace the whole content of a table in one transaction.
    /// Returns the number of records written.
    pub fn replace_table(&self, table: &str, records: &[Value]) -> StorageResult<usize> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        ensure_table(&tx, table)?;
        tx.execute(&format!("DELETE FROM {}", quote_ident(table)?), [])?;
        for record in records {
            upsert_on(&tx, table, as_object(record)?)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Drop a table and its rows. Returns true if it existed.
    pub fn drop_table(&self, table: &str) -> StorageResult<bool> {
        let conn = self.lock_conn();
        let existed = table_exists(&conn, table)?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)?))?;
        Ok(existed)
    }

    /// Number of records in a table; 0 when the table does not exist.
    pub fn count_records(&self, table: &str) -> StorageResult<i64> {
        let conn = self.lock_conn();
        if !table_exists(&conn, table)? {
            return Ok(0);
        }
        let count =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)?), [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }
}

fn as_object(value: &Value) -> StorageResult<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| StorageError::InvalidRecord(format!("expected a JSON object, got {value}")))
}

fn upsert_on(conn: &Connection, table: &str, record: &Map<String, Value>) -> StorageResult<()> {
    let id = record_id(record)?;
    ensure_table(conn, table)?;
    ensure_columns(conn, table, record.keys())?;

    let columns: Vec<&String> = record.keys().collect();
    let names = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<StorageResult<Vec<_>>>()?
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let values: Vec<SqlValue> = columns
        .iter()
        .map(|c| {
            if c.as_str() == "id" {
                SqlValue::Text(id.clone())
            } else {
                json_to_sql(&record[c.as_str()])
            }
        })
        .collect();

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} ({names}) VALUES ({placeholders})",
            quote_ident(table)?
        ),
        params_from_iter(values),
    )?;
    Ok(())
}

fn get_on(conn: &Connection, table: &str, id: &str) -> StorageResult<Option<Value>> {
    if !table_exists(conn, table)? {
        return Ok(None);
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {} WHERE id = ?1",
        quote_ident(table)?
    ))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_object(row, &columns, true)?)),
        None => Ok(None),
    }
}
