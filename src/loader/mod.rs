// Incremental loading
// Dedupe within a batch, skip identifiers already in the destination, append the rest

mod sqlite;

pub use sqlite::{SqliteDestination, SqliteSession};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::models::ActivityRow;

/// Default rows per insert transaction
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default destination table
pub const DEFAULT_TABLE_NAME: &str = "activities";

static TABLE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Reject anything that is not a plain SQL identifier
pub fn validate_table_name(name: &str) -> Result<()> {
    if TABLE_NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(SyncError::Config(format!("Invalid table name: {:?}", name)))
    }
}

/// Behaviour when the destination table already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Insert new identifiers into the existing table
    Append,
    /// Drop the table and write the batch into a fresh one
    Replace,
    /// Refuse to write into an existing table
    FailIfExists,
}

impl FromStr for ConflictPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "append" => Ok(ConflictPolicy::Append),
            "replace" => Ok(ConflictPolicy::Replace),
            "fail" | "fail-if-exists" | "fail_if_exists" => Ok(ConflictPolicy::FailIfExists),
            other => Err(SyncError::Config(format!(
                "Unknown conflict policy '{}' (expected append, replace or fail)",
                other
            ))),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictPolicy::Append => "append",
            ConflictPolicy::Replace => "replace",
            ConflictPolicy::FailIfExists => "fail-if-exists",
        };
        f.write_str(s)
    }
}

/// Destination store that hands out one session per load call
pub trait Destination: Send + Sync {
    fn connect(&self) -> Result<Box<dyn DestinationSession>>;
}

/// One connection to the destination; closed when dropped
pub trait DestinationSession {
    fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Which of `ids` are already present, in as few round trips as possible
    fn existing_ids(&mut self, table: &str, ids: &[i64]) -> Result<HashSet<i64>>;

    fn row_count(&mut self, table: &str) -> Result<u64>;

    fn drop_table(&mut self, table: &str) -> Result<()>;

    /// Create the table or add columns the rows need
    fn prepare_table(&mut self, table: &str, rows: &[ActivityRow]) -> Result<()>;

    /// Insert one chunk atomically, returning rows actually written
    ///
    /// Rows whose identifier is already stored are ignored, not rewritten.
    fn insert_chunk(&mut self, table: &str, rows: &[ActivityRow]) -> Result<usize>;

    /// Open a transaction spanning the following calls; chunk inserts nest inside it
    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

/// Counts reported by one load call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadResult {
    pub table: String,
    pub rows_processed: usize,
    pub duplicates_removed: usize,
    pub duplicate_ids: Vec<i64>,
    pub skipped_existing: usize,
    pub rows_loaded: usize,
    pub initial_row_count: u64,
    pub total_rows_in_table: u64,
    /// The existence check failed and every record was treated as new
    pub existence_check_degraded: bool,
}

/// Keep the first row per identifier, in input order
///
/// Returns the surviving rows and the identifiers that had duplicates.
pub fn dedupe_batch(rows: Vec<ActivityRow>) -> (Vec<ActivityRow>, Vec<i64>, usize) {
    let original = rows.len();
    let mut seen = HashSet::with_capacity(rows.len());
    let mut duplicate_ids = Vec::new();
    let mut kept = Vec::with_capacity(rows.len());

    for row in rows {
        if seen.insert(row.activity_id) {
            kept.push(row);
        } else if !duplicate_ids.contains(&row.activity_id) {
            duplicate_ids.push(row.activity_id);
        }
    }

    let removed = original - kept.len();
    (kept, duplicate_ids, removed)
}

/// Loads normalized rows without ever re-writing an existing identifier
pub struct IncrementalLoader {
    destination: Arc<dyn Destination>,
    policy: ConflictPolicy,
    chunk_size: usize,
}

impl IncrementalLoader {
    pub fn new(destination: Arc<dyn Destination>, policy: ConflictPolicy) -> Self {
        Self {
            destination,
            policy,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Dedupe, existence-check, filter and append `rows` into `table`
    pub fn load(&self, rows: Vec<ActivityRow>, table: &str) -> Result<LoadResult> {
        validate_table_name(table)?;

        let rows_processed = rows.len();
        tracing::info!(
            "Loading {} rows to table '{}' with policy '{}'",
            rows_processed,
            table,
            self.policy
        );

        let (rows, duplicate_ids, duplicates_removed) = dedupe_batch(rows);
        if duplicates_removed > 0 {
            tracing::warn!(
                "Removed {} duplicate activities within batch. IDs: {:?}",
                duplicates_removed,
                duplicate_ids
            );
        }

        let mut result = LoadResult {
            table: table.to_string(),
            rows_processed,
            duplicates_removed,
            duplicate_ids,
            ..LoadResult::default()
        };

        // Session lives for this call only and is closed on every return path
        let mut session = self
            .destination
            .connect()
            .map_err(|e| SyncError::load(format!("Failed to connect to destination: {}", e)))?;

        let exists = session
            .table_exists(table)
            .map_err(|e| SyncError::load(e.to_string()))?;

        if exists && self.policy == ConflictPolicy::FailIfExists {
            return Err(SyncError::load(format!(
                "Table '{}' already exists and policy is fail-if-exists",
                table
            )));
        }

        if exists {
            result.initial_row_count = session
                .row_count(table)
                .map_err(|e| SyncError::load(e.to_string()))?;
        }

        let existing = if !exists || self.policy == ConflictPolicy::Replace {
            HashSet::new()
        } else {
            let ids: Vec<i64> = rows.iter().map(|r| r.activity_id).collect();
            match session.existing_ids(table, &ids) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(
                        "Existence check failed, treating all {} records as new: {}",
                        ids.len(),
                        e
                    );
                    result.existence_check_degraded = true;
                    HashSet::new()
                }
            }
        };

        let new_rows: Vec<ActivityRow> = rows
            .into_iter()
            .filter(|r| !existing.contains(&r.activity_id))
            .collect();
        result.skipped_existing = existing.len();

        if result.skipped_existing > 0 {
            tracing::info!(
                "Skipping {} activities already present in '{}'",
                result.skipped_existing,
                table
            );
        }

        if self.policy == ConflictPolicy::Replace {
            // Drop, create and insert as one unit so a failed chunk keeps the old table
            session
                .begin()
                .map_err(|e| SyncError::load(e.to_string()))?;
            let outcome =
                self.replace_rows(session.as_mut(), table, exists, &new_rows, &mut result);
            match outcome {
                Ok(()) => session
                    .commit()
                    .map_err(|e| SyncError::load(e.to_string()))?,
                Err(e) => {
                    if let Err(rollback) = session.rollback() {
                        tracing::error!("Rollback of replace load failed: {}", rollback);
                    }
                    return Err(e);
                }
            }
        } else {
            self.write_rows(session.as_mut(), table, &new_rows, &mut result)?;
        }

        let table_now_exists = (exists && self.policy != ConflictPolicy::Replace)
            || !new_rows.is_empty();
        result.total_rows_in_table = if table_now_exists {
            session
                .row_count(table)
                .map_err(|e| SyncError::load(e.to_string()))?
        } else {
            0
        };

        tracing::info!(
            "Successfully loaded data to '{}'. Rows added: {}, Total rows: {}",
            table,
            result.rows_loaded,
            result.total_rows_in_table
        );

        Ok(result)
    }

    fn replace_rows(
        &self,
        session: &mut dyn DestinationSession,
        table: &str,
        exists: bool,
        rows: &[ActivityRow],
        result: &mut LoadResult,
    ) -> Result<()> {
        if exists {
            session
                .drop_table(table)
                .map_err(|e| SyncError::load(e.to_string()))?;
        }
        self.write_rows(session, table, rows, result)
    }

    /// Create or widen the table, then insert `rows` chunk by chunk
    fn write_rows(
        &self,
        session: &mut dyn DestinationSession,
        table: &str,
        rows: &[ActivityRow],
        result: &mut LoadResult,
    ) -> Result<()> {
        if rows.is_empty() {
            tracing::info!("No new activities to load");
            return Ok(());
        }

        session
            .prepare_table(table, rows)
            .map_err(|e| SyncError::load(e.to_string()))?;

        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let written = session
                .insert_chunk(table, chunk)
                .map_err(|e| SyncError::load(format!("Chunk {} failed: {}", index + 1, e)))?;
            tracing::debug!(chunk = index + 1, rows = written, "Inserted chunk");

            // Ignored rows were already stored; only possible when the existence check degraded
            let ignored = chunk.len().saturating_sub(written);
            if ignored > 0 {
                tracing::warn!(
                    "{} activities in chunk {} were already present and left unchanged",
                    ignored,
                    index + 1
                );
            }
            result.skipped_existing += ignored;
            result.rows_loaded += written;
        }
        Ok(())
    }
}
