// SQLite destination
// Dynamic activity table keyed by activity_id

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Destination, DestinationSession};
use crate::error::{Result, SyncError};
use crate::models::ActivityRow;

/// Identifiers per membership query, kept under SQLite's bound-parameter limit
const EXISTENCE_CHUNK_SIZE: usize = 500;

/// How long a locked database is waited on before the statement fails
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ID_COLUMN: &str = "activity_id";

/// SQLite file holding the activity table
#[derive(Debug, Clone)]
pub struct SqliteDestination {
    path: PathBuf,
}

impl SqliteDestination {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a session directly, without going through the trait object
    pub fn open(&self) -> Result<SqliteSession> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    SyncError::load(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(&self.path).map_err(|e| {
            SyncError::load(format!(
                "Failed to open database {}: {}",
                self.path.display(),
                e
            ))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| SyncError::load(format!("Failed to set busy timeout: {}", e)))?;

        Ok(SqliteSession { conn })
    }

    /// Read one stored value back as JSON
    pub fn read_column(&self, activity_id: i64, table: &str, column: &str) -> Result<Option<Value>> {
        let session = self.open()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            quote_ident(column),
            quote_ident(table),
            quote_ident(ID_COLUMN)
        );
        session
            .conn
            .query_row(&sql, params![activity_id], |row| {
                Ok(sql_to_json(row.get_ref(0)?))
            })
            .optional()
            .map_err(|e| SyncError::load(format!("Failed to read {}: {}", column, e)))
    }
}

impl Destination for SqliteDestination {
    fn connect(&self) -> Result<Box<dyn DestinationSession>> {
        Ok(Box::new(self.open()?))
    }
}

/// One open connection; dropping it closes the connection
pub struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    fn columns(&self, table: &str) -> Result<HashSet<String>> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| SyncError::load(format!("Failed to read table schema: {}", e)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| SyncError::load(format!("Failed to read table schema: {}", e)))?
            .collect::<std::result::Result<HashSet<_>, _>>()
            .map_err(|e| SyncError::load(format!("Failed to read table schema: {}", e)))?;
        Ok(names)
    }
}

impl DestinationSession for SqliteSession {
    fn table_exists(&mut self, table: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SyncError::load(format!("Failed to inspect tables: {}", e)))?;
        Ok(found.is_some())
    }

    fn existing_ids(&mut self, table: &str, ids: &[i64]) -> Result<HashSet<i64>> {
        let mut found = HashSet::new();

        for chunk in ids.chunks(EXISTENCE_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {id} FROM {table} WHERE {id} IN ({placeholders})",
                id = quote_ident(ID_COLUMN),
                table = quote_ident(table),
                placeholders = placeholders
            );

            let mut stmt = self
                .conn
                .prepare(&sql)
                .map_err(|e| SyncError::ExistenceCheck(e.to_string()))?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| row.get::<_, i64>(0))
                .map_err(|e| SyncError::ExistenceCheck(e.to_string()))?;

            for id in rows {
                found.insert(id.map_err(|e| SyncError::ExistenceCheck(e.to_string()))?);
            }
        }

        tracing::debug!(
            checked = ids.len(),
            present = found.len(),
            "Existence check complete"
        );
        Ok(found)
    }

    fn row_count(&mut self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(|e| SyncError::load(format!("Failed to count rows: {}", e)))?;
        Ok(count.max(0) as u64)
    }

    fn drop_table(&mut self, table: &str) -> Result<()> {
        tracing::info!("Dropping table '{}'", table);
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .map_err(|e| SyncError::load(format!("Failed to drop table: {}", e)))
    }

    fn prepare_table(&mut self, table: &str, rows: &[ActivityRow]) -> Result<()> {
        let wanted = column_types(rows);

        if !self.table_exists(table)? {
            let mut defs = vec![format!("{} INTEGER PRIMARY KEY", quote_ident(ID_COLUMN))];
            defs.extend(wanted.iter().map(|(name, ty)| column_def(name, ty)));

            let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(table), defs.join(", "));
            self.conn
                .execute_batch(&sql)
                .map_err(|e| SyncError::load(format!("Failed to create table: {}", e)))?;
            tracing::info!("Created table '{}' with {} columns", table, defs.len());
            return Ok(());
        }

        let present = self.columns(table)?;
        for (name, ty) in wanted.iter().filter(|(name, _)| !present.contains(name.as_str())) {
            let sql = format!("ALTER TABLE {} ADD COLUMN {}", quote_ident(table), column_def(name, ty));
            self.conn
                .execute_batch(&sql)
                .map_err(|e| SyncError::load(format!("Failed to add column {}: {}", name, e)))?;
            tracing::info!("Added column '{}' to '{}'", name, table);
        }
        Ok(())
    }

    fn insert_chunk(&mut self, table: &str, rows: &[ActivityRow]) -> Result<usize> {
        let extra: BTreeSet<&str> = rows
            .iter()
            .flat_map(|r| r.columns.keys().map(String::as_str))
            .collect();
        let mut names = vec![ID_COLUMN];
        names.extend(extra);

        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            quote_ident(table),
            names.iter().map(|n| quote_ident(n)).collect::<Vec<_>>().join(", "),
            vec!["?"; names.len()].join(", ")
        );

        // Savepoint rather than BEGIN so a chunk can nest inside a replace transaction
        let tx = self
            .conn
            .savepoint()
            .map_err(|e| SyncError::load(format!("Failed to begin transaction: {}", e)))?;

        let mut written = 0;
        {
            let mut stmt = tx
                .prepare(&sql)
                .map_err(|e| SyncError::load(format!("Failed to prepare insert: {}", e)))?;

            for row in rows {
                let mut values = Vec::with_capacity(names.len());
                values.push(SqlValue::Integer(row.activity_id));
                values.extend(
                    names[1..]
                        .iter()
                        .map(|name| row.get(name).map(json_to_sql).unwrap_or(SqlValue::Null)),
                );

                written += stmt.execute(params_from_iter(values.iter())).map_err(|e| {
                    SyncError::load(format!("Failed to insert activity {}: {}", row.activity_id, e))
                })?;
            }
        }

        tx.commit()
            .map_err(|e| SyncError::load(format!("Failed to commit chunk: {}", e)))?;
        Ok(written)
    }

    fn begin(&mut self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| SyncError::load(format!("Failed to begin transaction: {}", e)))
    }

    fn commit(&mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| SyncError::load(format!("Failed to commit: {}", e)))
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| SyncError::load(format!("Failed to roll back: {}", e)))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_def(name: &str, ty: &str) -> String {
    if ty.is_empty() {
        quote_ident(name)
    } else {
        format!("{} {}", quote_ident(name), ty)
    }
}

/// Declared type per column, from the first non-null value seen
///
/// Columns that are null in every row get no declared type.
fn column_types(rows: &[ActivityRow]) -> BTreeMap<String, &'static str> {
    let mut types: BTreeMap<String, &'static str> = BTreeMap::new();
    for row in rows {
        for (name, value) in &row.columns {
            let ty = sql_type(value);
            let entry = types.entry(name.clone()).or_insert(ty);
            if entry.is_empty() {
                *entry = ty;
            }
        }
    }
    types
}

fn sql_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "",
        Value::Bool(_) => "INTEGER",
        Value::Number(n) if n.is_i64() || n.is_u64() => "INTEGER",
        Value::Number(_) => "REAL",
        Value::String(_) | Value::Array(_) | Value::Object(_) => "TEXT",
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // Nested values are stored as JSON text
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::from(b.to_vec()),
    }
}
