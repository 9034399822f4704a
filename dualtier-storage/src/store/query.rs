//! Raw SQL execution with named JSON parameters.

use super::helpers::{json_to_sql, row_to_object};
use super::LocalStore;
use crate::error::{StorageError, StorageResult};
use rusqlite::Statement;
use serde_json::{Map, Value};

impl LocalStore {
    /// Execute a single SQL statement.
    ///
    /// Named parameters (`$name`, `:name`, `@name`) are bound from `vars`.
    /// Statements that produce columns return one JSON object per row;
    /// other statements return an empty list.
    pub fn execute(&self, sql: &str, vars: &Map<String, Value>) -> StorageResult<Vec<Value>> {
        let sql = sql.trim().trim_end_matches(';').trim();
        if sql.is_empty() {
            return Err(StorageError::InvalidQuery("empty statement".to_string()));
        }

        let conn = self.lock_conn();
        let mut stmt = conn.prepare(sql)?;
        bind_named(&mut stmt, vars)?;

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        if columns.is_empty() {
            let changed = stmt.raw_execute()?;
            tracing::trace!("local statement changed {changed} rows");
            return Ok(Vec::new());
        }

        let mut rows = stmt.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_object(row, &columns, false)?);
        }
        Ok(out)
    }
}

fn bind_named(stmt: &mut Statement<'_>, vars: &Map<String, Value>) -> StorageResult<()> {
    for idx in 1..=stmt.parameter_count() {
        let name = stmt.parameter_name(idx).map(str::to_owned);
        let Some(name) = name.filter(|n| !n.starts_with('?')) else {
            return Err(StorageError::InvalidQuery(format!(
                "positional parameter ?{idx} is not supported; use a named parameter"
            )));
        };
        let key = name.trim_start_matches([':', '$', '@']);
        let value = vars
            .get(key)
            .ok_or_else(|| StorageError::InvalidQuery(format!("missing parameter {name}")))?;
        stmt.raw_bind_parameter(idx, json_to_sql(value))?;
    }
    Ok(())
}
