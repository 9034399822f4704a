//! Shared helper functions for local store operations.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, Row};
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

/// Longest identifier accepted for tables, columns and database names.
const MAX_IDENTIFIER_LEN: usize = 128;

/// Accept only ASCII alphanumerics and underscores.
pub(crate) fn validate_identifier(name: &str) -> StorageResult<&str> {
    if name.is_empty()
        || name.len() > MAX_IDENTIFIER_LEN
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StorageError::InvalidIdentifier(name.to_string()));
    }
    Ok(name)
}

/// Validate and double-quote an identifier for interpolation into SQL.
pub(crate) fn quote_ident(name: &str) -> StorageResult<String> {
    Ok(format!("\"{}\"", validate_identifier(name)?))
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> StorageResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of an existing table.
pub(crate) fn existing_columns(conn: &Connection, table: &str) -> StorageResult<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)?))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(columns)
}

/// Create the record table if missing. Every record table is keyed by `id`.
pub(crate) fn ensure_table(conn: &Connection, table: &str) -> StorageResult<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY)",
        quote_ident(table)?
    ))?;
    Ok(())
}

/// Add an untyped column for every record key the table lacks.
pub(crate) fn ensure_columns<'a>(
    conn: &Connection,
    table: &str,
    keys: impl IntoIterator<Item = &'a String>,
) -> StorageResult<()> {
    let existing = existing_columns(conn, table)?;
    let quoted_table = quote_ident(table)?;
    for key in keys {
        if existing.contains(key.as_str()) {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE {quoted_table} ADD COLUMN {}",
            quote_ident(key)?
        ))?;
    }
    Ok(())
}

/// Pull the string id out of a record object.
pub(crate) fn record_id(record: &Map<String, Value>) -> StorageResult<String> {
    match record.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(StorageError::InvalidRecord(
            "record must carry a non-empty `id`".to_string(),
        )),
    }
}

/// Convert a JSON value into a SQLite value. Booleans become integers,
/// arrays and objects are stored as JSON text.
pub(crate) fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Convert a SQLite value back to JSON, decoding nested JSON text.
pub(crate) fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if text.starts_with('{') || text.starts_with('[') {
                if let Ok(nested) = serde_json::from_str::<Value>(&text) {
                    return nested;
                }
            }
            Value::String(text.into_owned())
        }
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Build a JSON object from a result row.
pub(crate) fn row_to_object(
    row: &Row<'_>,
    columns: &[String],
    skip_nulls: bool,
) -> rusqlite::Result<Value> {
    let mut object = Map::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        let value = sql_to_json(row.get_ref(idx)?);
        if skip_nulls && value.is_null() {
            continue;
        }
        object.insert(name.clone(), value);
    }
    Ok(Value::Object(object))
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
