//! SQLite persistence for runs, unit records, and the per-run event log.
//!
//! WAL journal mode with foreign keys enforced; deleting a run cascades to
//! its units and events. Lookups return `Ok(None)` for missing rows so
//! callers can distinguish not-found from I/O failure. Duplicate active runs
//! surface as a typed error detected through the driver's structured
//! unique-violation signal, never by matching message text.

use chrono::{DateTime, Utc};
use choo_core::types::{EventRecord, Run, RunId, RunStatus, UnitRecord, UnitStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("active run already exists for branch {feature_branch} in {repo_path}")]
    DuplicateRun {
        feature_branch: String,
        repo_path: String,
    },
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("unit not found: {0}")]
    UnitNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// True when the error is the driver's structured duplicate-key signal.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Run embedded migrations. Schema is append-only across versions.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    sqlx::query(trimmed).execute(&self.pool).await?;
                }
            }
        }
        Ok(())
    }

    // --- Run operations ---

    /// Insert a new run.
    ///
    /// Any terminal run for the same `(feature_branch, repo_path)` is removed
    /// first, so a unique violation here always means an active run exists.
    pub async fn create_run(&self, run: &Run) -> Result<()> {
        self.delete_non_active_run_by_branch(&run.feature_branch, &run.repo_path)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO runs (id, feature_branch, repo_path, target_branch, tasks_dir,
                              parallelism, status, daemon_version, config_json,
                              started_at, completed_at, error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(&run.feature_branch)
        .bind(&run.repo_path)
        .bind(&run.target_branch)
        .bind(&run.tasks_dir)
        .bind(i64::from(run.parallelism))
        .bind(run.status.as_str())
        .bind(&run.daemon_version)
        .bind(&run.config_json)
        .bind(run.started_at.map(|t| t.timestamp_millis()))
        .bind(run.completed_at.map(|t| t.timestamp_millis()))
        .bind(&run.error)
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StorageError::DuplicateRun {
                feature_branch: run.feature_branch.clone(),
                repo_path: run.repo_path.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Update run status; `started_at`/`completed_at` stamp exactly once on
    /// the transition into running / a terminal status.
    pub async fn update_run_status(
        &self,
        id: &RunId,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = ?1,
                error = COALESCE(?2, error),
                updated_at = ?3,
                started_at = CASE
                    WHEN ?1 = 'running' AND started_at IS NULL THEN ?3
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN ?1 IN ('completed', 'failed', 'cancelled') AND completed_at IS NULL THEN ?3
                    ELSE completed_at
                END
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Get a run by id; `Ok(None)` when missing.
    pub async fn get_run(&self, id: &RunId) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM runs WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RunRow::into_run))
    }

    /// Get a run by `(feature_branch, repo_path)`; `Ok(None)` when missing.
    pub async fn get_run_by_branch(
        &self,
        feature_branch: &str,
        repo_path: &str,
    ) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE feature_branch = ?1 AND repo_path = ?2",
        )
        .bind(feature_branch)
        .bind(repo_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RunRow::into_run))
    }

    /// Get the active (pending or running) run for a branch, if any.
    pub async fn get_active_run_by_branch(
        &self,
        feature_branch: &str,
        repo_path: &str,
    ) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE feature_branch = ?1 AND repo_path = ?2 \
             AND status IN ('pending', 'running')",
        )
        .bind(feature_branch)
        .bind(repo_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RunRow::into_run))
    }

    /// Runs with status pending or running, used on daemon boot to reattach
    /// or garbage-collect.
    pub async fn list_incomplete_runs(&self) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE status IN ('pending', 'running') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    /// Delete a non-active run for the branch, freeing the unique slot.
    pub async fn delete_non_active_run_by_branch(
        &self,
        feature_branch: &str,
        repo_path: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM runs WHERE feature_branch = ?1 AND repo_path = ?2 \
             AND status NOT IN ('pending', 'running')",
        )
        .bind(feature_branch)
        .bind(repo_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a run; units and events cascade.
    pub async fn delete_run(&self, id: &RunId) -> Result<()> {
        sqlx::query("DELETE FROM runs WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Unit operations ---

    pub async fn create_unit(&self, unit: &UnitRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO units (run_id, unit_id, status, branch, worktree_path,
                               started_at, completed_at, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(unit.run_id.as_ref())
        .bind(&unit.unit_id)
        .bind(unit.status.as_str())
        .bind(&unit.branch)
        .bind(&unit.worktree_path)
        .bind(unit.started_at.map(|t| t.timestamp_millis()))
        .bind(unit.completed_at.map(|t| t.timestamp_millis()))
        .bind(&unit.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update unit status with the same timestamp rules as runs:
    /// `in_progress` stamps `started_at`, terminal stamps `completed_at`.
    pub async fn update_unit_status(
        &self,
        run_id: &RunId,
        unit_id: &str,
        status: UnitStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE units SET
                status = ?1,
                error = COALESCE(?2, error),
                started_at = CASE
                    WHEN ?1 = 'in_progress' AND started_at IS NULL THEN ?3
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN ?1 IN ('complete', 'failed') AND completed_at IS NULL THEN ?3
                    ELSE completed_at
                END
            WHERE run_id = ?4 AND unit_id = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(run_id.as_ref())
        .bind(unit_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::UnitNotFound(unit_id.to_string()));
        }
        Ok(())
    }

    /// Record the branch and worktree assigned to a unit.
    pub async fn update_unit_branch(
        &self,
        run_id: &RunId,
        unit_id: &str,
        branch: &str,
        worktree_path: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE units SET branch = ?1, worktree_path = ?2 WHERE run_id = ?3 AND unit_id = ?4",
        )
        .bind(branch)
        .bind(worktree_path)
        .bind(run_id.as_ref())
        .bind(unit_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::UnitNotFound(unit_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_unit(&self, run_id: &RunId, unit_id: &str) -> Result<Option<UnitRecord>> {
        let row = sqlx::query_as::<_, UnitRow>(
            "SELECT * FROM units WHERE run_id = ?1 AND unit_id = ?2",
        )
        .bind(run_id.as_ref())
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UnitRow::into_unit))
    }

    pub async fn list_units_by_run(&self, run_id: &RunId) -> Result<Vec<UnitRecord>> {
        let rows = sqlx::query_as::<_, UnitRow>(
            "SELECT * FROM units WHERE run_id = ?1 ORDER BY unit_id ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UnitRow::into_unit).collect())
    }

    pub async fn list_units_by_status(
        &self,
        run_id: &RunId,
        status: UnitStatus,
    ) -> Result<Vec<UnitRecord>> {
        let rows = sqlx::query_as::<_, UnitRow>(
            "SELECT * FROM units WHERE run_id = ?1 AND status = ?2 ORDER BY unit_id ASC",
        )
        .bind(run_id.as_ref())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UnitRow::into_unit).collect())
    }

    // --- Event operations ---

    /// Append an event, assigning the next sequence number.
    ///
    /// The sequence computation and insert are a single atomic statement, so
    /// per-run sequences stay gap-free under concurrent appends; a unique
    /// conflict is retried once before the error propagates.
    pub async fn append_event(
        &self,
        run_id: &RunId,
        event_type: &str,
        unit_id: Option<&str>,
        payload: Option<&serde_json::Value>,
    ) -> Result<EventRecord> {
        let payload_json = payload.map(serde_json::Value::to_string);

        match self
            .try_append_event(run_id, event_type, unit_id, payload_json.as_deref())
            .await
        {
            Err(StorageError::Database(e)) if is_unique_violation(&e) => {
                self.try_append_event(run_id, event_type, unit_id, payload_json.as_deref())
                    .await
            }
            other => other,
        }
    }

    async fn try_append_event(
        &self,
        run_id: &RunId,
        event_type: &str,
        unit_id: Option<&str>,
        payload_json: Option<&str>,
    ) -> Result<EventRecord> {
        let now = Utc::now();
        let (sequence,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO events (run_id, sequence, type, unit_id, payload_json, ts)
            VALUES (
                ?1,
                (SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE run_id = ?1),
                ?2, ?3, ?4, ?5
            )
            RETURNING sequence
            "#,
        )
        .bind(run_id.as_ref())
        .bind(event_type)
        .bind(unit_id)
        .bind(payload_json)
        .bind(now.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(EventRecord {
            run_id: run_id.clone(),
            sequence,
            event_type: event_type.to_string(),
            unit_id: unit_id.map(str::to_string),
            payload_json: payload_json.map(str::to_string),
            timestamp: now,
        })
    }

    pub async fn list_events(&self, run_id: &RunId) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE run_id = ?1 ORDER BY sequence ASC",
        )
        .bind(run_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    /// Events with sequence greater than `after`, in order; the replay path
    /// for resume and live monitoring.
    pub async fn list_events_since(&self, run_id: &RunId, after: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE run_id = ?1 AND sequence > ?2 ORDER BY sequence ASC",
        )
        .bind(run_id.as_ref())
        .bind(after)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    feature_branch: String,
    repo_path: String,
    target_branch: String,
    tasks_dir: String,
    parallelism: i64,
    status: String,
    daemon_version: String,
    config_json: Option<String>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> Run {
        Run {
            id: RunId::from_string(self.id),
            feature_branch: self.feature_branch,
            repo_path: self.repo_path,
            target_branch: self.target_branch,
            tasks_dir: self.tasks_dir,
            parallelism: self.parallelism as u32,
            status: RunStatus::from_str(&self.status).unwrap_or(RunStatus::Failed),
            daemon_version: self.daemon_version,
            config_json: self.config_json,
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
            error: self.error,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct UnitRow {
    run_id: String,
    unit_id: String,
    status: String,
    branch: Option<String>,
    worktree_path: Option<String>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl UnitRow {
    fn into_unit(self) -> UnitRecord {
        UnitRecord {
            run_id: RunId::from_string(self.run_id),
            unit_id: self.unit_id,
            status: UnitStatus::from_str(&self.status).unwrap_or(UnitStatus::Failed),
            branch: self.branch,
            worktree_path: self.worktree_path,
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
            error: self.error,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    #[allow(dead_code)]
    id: i64,
    run_id: String,
    sequence: i64,
    #[sqlx(rename = "type")]
    event_type: String,
    unit_id: Option<String>,
    payload_json: Option<String>,
    ts: i64,
}

impl EventRow {
    fn into_event(self) -> EventRecord {
        EventRecord {
            run_id: RunId::from_string(self.run_id),
            sequence: self.sequence,
            event_type: self.event_type,
            unit_id: self.unit_id,
            payload_json: self.payload_json,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
        }
    }
}
