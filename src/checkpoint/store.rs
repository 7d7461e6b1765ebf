//! SQLite-backed checkpoint store.
//!
//! One database file per pipeline (`<dir>/<pipeline>_checkpoint.db`), one row
//! per (scope, key). Every mark is an upsert, so callers never need to know
//! whether a record exists yet.

use super::checksum::file_checksum;
use super::record::{
    CheckpointFilter, CheckpointRecord, CheckpointScope, CheckpointStatistics, CheckpointStatus,
    StatusSummary,
};
use crate::models::{validate_pipeline_name, Metadata, PipelineError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest error message kept on a FAILED record.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS checkpoints (
        pipeline_name TEXT NOT NULL,
        scope TEXT NOT NULL,
        scope_key TEXT NOT NULL,
        file_path TEXT,
        checksum TEXT,
        status TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        failed_at TEXT,
        error_message TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (pipeline_name, scope, scope_key)
    );
    CREATE INDEX IF NOT EXISTS idx_checkpoints_status
        ON checkpoints(pipeline_name, status);
";

const COLUMNS: &str = "scope, scope_key, file_path, status, checksum, error_message, metadata, \
                       started_at, completed_at, failed_at, created_at, updated_at";

/// Optional filter terms; a NULL parameter matches every row.
const FILTER: &str = "(?2 IS NULL OR scope = ?2) \
                      AND (?3 IS NULL OR scope_key = ?3) \
                      AND (?4 IS NULL OR status = ?4)";

/// Durable per-pipeline record of which work items are done.
///
/// The connection sits behind a mutex, so one store can be shared across
/// worker threads through an `Arc`.
pub struct CheckpointStore {
    pipeline_name: String,
    db_path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("pipeline_name", &self.pipeline_name)
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    /// Open (or create) the store for `pipeline_name` under `dir`.
    pub fn open(pipeline_name: &str, dir: &Path) -> Result<Self> {
        validate_pipeline_name(pipeline_name)?;
        fs::create_dir_all(dir).map_err(|e| PipelineError::io("creating checkpoint dir", e))?;

        let db_path = dir.join(format!("{pipeline_name}_checkpoint.db"));
        let conn = Connection::open(&db_path)
            .map_err(|e| PipelineError::checkpoint(format!("opening {}", db_path.display()), e))?;

        let store = Self::init(pipeline_name, Some(db_path), conn)?;
        info!(pipeline = pipeline_name, path = ?store.db_path, "Opened checkpoint store");
        Ok(store)
    }

    /// Store that lives only as long as this value.
    pub fn open_in_memory(pipeline_name: &str) -> Result<Self> {
        validate_pipeline_name(pipeline_name)?;
        let conn = Connection::open_in_memory()
            .map_err(|e| PipelineError::checkpoint("opening in-memory database", e))?;
        Self::init(pipeline_name, None, conn)
    }

    fn init(pipeline_name: &str, db_path: Option<PathBuf>, conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| PipelineError::checkpoint("setting busy timeout", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| PipelineError::checkpoint("creating schema", e))?;

        Ok(Self {
            pipeline_name: pipeline_name.to_string(),
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Database file, `None` for in-memory stores.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `(scope, key)` is COMPLETED.
    ///
    /// With `verify_checksum` and a `file_path`, the file must still hash to
    /// the stored checksum. A changed or unreadable file, or a record without
    /// a checksum, counts as not done.
    pub fn is_completed(
        &self,
        scope: CheckpointScope,
        key: &str,
        file_path: Option<&Path>,
        verify_checksum: bool,
    ) -> Result<bool> {
        let Some(record) = self.get(scope, key)? else {
            return Ok(false);
        };
        if record.status != CheckpointStatus::Completed {
            return Ok(false);
        }

        if let (true, Some(path)) = (verify_checksum, file_path) {
            let Some(stored) = &record.checksum else {
                info!(%scope, key, "No checksum recorded, reprocessing");
                return Ok(false);
            };
            match file_checksum(path) {
                Ok(current) if &current == stored => {}
                Ok(_) => {
                    info!(
                        %scope,
                        key,
                        path = %path.display(),
                        "File changed since checkpoint, reprocessing"
                    );
                    return Ok(false);
                }
                Err(e) => {
                    warn!(
                        %scope,
                        key,
                        path = %path.display(),
                        error = %e,
                        "Cannot verify checksum"
                    );
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Record that work on `(scope, key)` has begun.
    pub fn mark_started(
        &self,
        scope: CheckpointScope,
        key: &str,
        file_path: Option<&Path>,
        metadata: &Metadata,
    ) -> Result<()> {
        let checksum = checksum_of(file_path);
        let metadata = serde_json::to_string(metadata)
            .map_err(|e| PipelineError::Internal(format!("serializing metadata: {e}")))?;
        let now = timestamp();

        self.conn()
            .execute(
                "INSERT INTO checkpoints (pipeline_name, scope, scope_key, file_path, checksum,
                     status, started_at, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'in_progress', ?6, ?7, ?6, ?6)
                 ON CONFLICT(pipeline_name, scope, scope_key) DO UPDATE SET
                     file_path = COALESCE(excluded.file_path, file_path),
                     checksum = COALESCE(excluded.checksum, checksum),
                     status = excluded.status,
                     started_at = excluded.started_at,
                     completed_at = NULL,
                     failed_at = NULL,
                     error_message = NULL,
                     metadata = CASE WHEN excluded.metadata = '{}' THEN metadata
                                     ELSE excluded.metadata END,
                     updated_at = excluded.updated_at",
                params![
                    self.pipeline_name,
                    scope.as_str(),
                    key,
                    path_text(file_path),
                    checksum,
                    now,
                    metadata,
                ],
            )
            .map_err(|e| PipelineError::checkpoint(format!("marking {scope}:{key} started"), e))?;

        debug!(%scope, key, "Checkpoint started");
        Ok(())
    }

    /// Record that `(scope, key)` finished successfully.
    ///
    /// Recomputes the checksum when `file_path` is given; an unreadable file
    /// keeps whatever checksum was stored before.
    pub fn mark_completed(
        &self,
        scope: CheckpointScope,
        key: &str,
        file_path: Option<&Path>,
    ) -> Result<()> {
        let checksum = checksum_of(file_path);
        let now = timestamp();

        self.conn()
            .execute(
                "INSERT INTO checkpoints (pipeline_name, scope, scope_key, file_path, checksum,
                     status, completed_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'completed', ?6, ?6, ?6)
                 ON CONFLICT(pipeline_name, scope, scope_key) DO UPDATE SET
                     file_path = COALESCE(excluded.file_path, file_path),
                     checksum = COALESCE(excluded.checksum, checksum),
                     status = excluded.status,
                     completed_at = excluded.completed_at,
                     failed_at = NULL,
                     error_message = NULL,
                     updated_at = excluded.updated_at",
                params![
                    self.pipeline_name,
                    scope.as_str(),
                    key,
                    path_text(file_path),
                    checksum,
                    now,
                ],
            )
            .map_err(|e| PipelineError::checkpoint(format!("marking {scope}:{key} completed"), e))?;

        debug!(%scope, key, "Checkpoint completed");
        Ok(())
    }

    /// Record that `(scope, key)` failed with `error_message`.
    pub fn mark_failed(
        &self,
        scope: CheckpointScope,
        key: &str,
        error_message: &str,
        file_path: Option<&Path>,
    ) -> Result<()> {
        let checksum = checksum_of(file_path);
        let message: String = error_message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
        let now = timestamp();

        self.conn()
            .execute(
                "INSERT INTO checkpoints (pipeline_name, scope, scope_key, file_path, checksum,
                     status, failed_at, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'failed', ?6, ?7, ?6, ?6)
                 ON CONFLICT(pipeline_name, scope, scope_key) DO UPDATE SET
                     file_path = COALESCE(excluded.file_path, file_path),
                     checksum = COALESCE(excluded.checksum, checksum),
                     status = excluded.status,
                     failed_at = excluded.failed_at,
                     completed_at = NULL,
                     error_message = excluded.error_message,
                     updated_at = excluded.updated_at",
                params![
                    self.pipeline_name,
                    scope.as_str(),
                    key,
                    path_text(file_path),
                    checksum,
                    now,
                    message,
                ],
            )
            .map_err(|e| PipelineError::checkpoint(format!("marking {scope}:{key} failed"), e))?;

        warn!(%scope, key, error = %message, "Checkpoint failed");
        Ok(())
    }

    pub fn get(&self, scope: CheckpointScope, key: &str) -> Result<Option<CheckpointRecord>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM checkpoints
                     WHERE pipeline_name = ?1 AND scope = ?2 AND scope_key = ?3"
                ),
                params![self.pipeline_name, scope.as_str(), key],
                record_from_row,
            )
            .optional()
            .map_err(|e| PipelineError::checkpoint(format!("reading {scope}:{key}"), e))
    }

    pub fn get_status(
        &self,
        scope: CheckpointScope,
        key: &str,
    ) -> Result<Option<CheckpointStatus>> {
        Ok(self.get(scope, key)?.map(|r| r.status))
    }

    /// Records that still need work (PENDING, IN_PROGRESS, FAILED), oldest first.
    pub fn get_pending(&self, filter: &CheckpointFilter) -> Result<Vec<CheckpointRecord>> {
        self.query(
            filter,
            "status != 'completed'",
            "created_at ASC, rowid ASC",
            "listing pending checkpoints",
        )
    }

    /// COMPLETED records, most recently completed first.
    pub fn get_completed(&self, filter: &CheckpointFilter) -> Result<Vec<CheckpointRecord>> {
        self.query(
            filter,
            "status = 'completed'",
            "completed_at DESC, rowid DESC",
            "listing completed checkpoints",
        )
    }

    fn query(
        &self,
        filter: &CheckpointFilter,
        condition: &str,
        order: &str,
        context: &str,
    ) -> Result<Vec<CheckpointRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM checkpoints
             WHERE pipeline_name = ?1 AND {condition} AND {FILTER}
             ORDER BY {order}"
        );

        let conn = self.conn();
        let run = || -> rusqlite::Result<Vec<CheckpointRecord>> {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    self.pipeline_name,
                    filter.scope.map(CheckpointScope::as_str),
                    filter.key.as_deref(),
                    filter.status.map(CheckpointStatus::as_str),
                ],
                record_from_row,
            )?;
            rows.collect()
        };
        run().map_err(|e| PipelineError::checkpoint(context, e))
    }

    /// Counts per status and scope for this pipeline.
    pub fn get_statistics(&self) -> Result<CheckpointStatistics> {
        let conn = self.conn();
        let run = || -> rusqlite::Result<CheckpointStatistics> {
            let mut by_status = BTreeMap::new();
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*), MIN(created_at), MAX(updated_at)
                 FROM checkpoints WHERE pipeline_name = ?1 GROUP BY status",
            )?;
            let mut rows = stmt.query(params![self.pipeline_name])?;
            while let Some(row) = rows.next()? {
                let status: CheckpointStatus = parse_enum(row, 0)?;
                let count: i64 = row.get(1)?;
                by_status.insert(
                    status,
                    StatusSummary {
                        count: count as usize,
                        first_created: parse_time(row, 2)?,
                        last_updated: parse_time(row, 3)?,
                    },
                );
            }

            let mut by_scope = BTreeMap::new();
            let mut stmt = conn.prepare(
                "SELECT scope, COUNT(*) FROM checkpoints WHERE pipeline_name = ?1 GROUP BY scope",
            )?;
            let mut rows = stmt.query(params![self.pipeline_name])?;
            while let Some(row) = rows.next()? {
                let scope: CheckpointScope = parse_enum(row, 0)?;
                let count: i64 = row.get(1)?;
                by_scope.insert(scope, count as usize);
            }

            let total = by_status.values().map(|s: &StatusSummary| s.count).sum();
            Ok(CheckpointStatistics {
                pipeline_name: self.pipeline_name.clone(),
                by_status,
                by_scope,
                total,
            })
        };
        run().map_err(|e| PipelineError::checkpoint("computing statistics", e))
    }

    /// Delete one record. Returns whether it existed.
    pub fn clear_checkpoint(&self, scope: CheckpointScope, key: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM checkpoints
                 WHERE pipeline_name = ?1 AND scope = ?2 AND scope_key = ?3",
                params![self.pipeline_name, scope.as_str(), key],
            )
            .map_err(|e| PipelineError::checkpoint(format!("clearing {scope}:{key}"), e))?;

        if deleted > 0 {
            info!(%scope, key, "Cleared checkpoint");
        }
        Ok(deleted > 0)
    }

    /// Delete every record matching `filter`. Returns how many were removed.
    pub fn clear_all_checkpoints(&self, filter: &CheckpointFilter) -> Result<usize> {
        let deleted = self
            .conn()
            .execute(
                &format!("DELETE FROM checkpoints WHERE pipeline_name = ?1 AND {FILTER}"),
                params![
                    self.pipeline_name,
                    filter.scope.map(CheckpointScope::as_str),
                    filter.key.as_deref(),
                    filter.status.map(CheckpointStatus::as_str),
                ],
            )
            .map_err(|e| PipelineError::checkpoint("clearing checkpoints", e))?;

        info!(count = deleted, ?filter, "Cleared checkpoints");
        Ok(deleted)
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn path_text(path: Option<&Path>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

fn checksum_of(path: Option<&Path>) -> Option<String> {
    let path = path?;
    match file_checksum(path) {
        Ok(sum) => Some(sum),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot compute checksum");
            None
        }
    }
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = PipelineError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => parse_time(row, idx).map(Some),
        None => Ok(None),
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CheckpointRecord> {
    let metadata: String = row.get(6)?;
    Ok(CheckpointRecord {
        scope: parse_enum(row, 0)?,
        key: row.get(1)?,
        file_path: row.get(2)?,
        status: parse_enum(row, 3)?,
        checksum: row.get(4)?,
        error_message: row.get(5)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(6, e))?,
        started_at: parse_opt_time(row, 7)?,
        completed_at: parse_opt_time(row, 8)?,
        failed_at: parse_opt_time(row, 9)?,
        created_at: parse_time(row, 10)?,
        updated_at: parse_time(row, 11)?,
    })
}
