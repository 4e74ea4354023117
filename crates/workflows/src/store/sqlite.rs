use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, error, info};

use crate::{
    store::{RunStore, RunSummary},
    workflow::{RunStatus, WorkflowRun},
    Error, Result,
};

pub struct SqliteRunStore {
    pool: Pool<Sqlite>,
}

impl SqliteRunStore {
    /// Open (creating if needed) the database at `path`. `":memory:"` gives a
    /// private in-memory database held by a single connection.
    pub async fn new(path: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to SQLite database: {}", path);

        let pool = if path == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(
                    SqliteConnectOptions::new()
                        .filename(path)
                        .create_if_missing(true),
                )
                .await
        }
        .map_err(|e| {
            error!("Failed to connect to SQLite: {}", e);
            Error::Sqlx(e)
        })?;

        Ok(Self { pool })
    }

    async fn stored_checkpoint(&self, run_id: &str) -> Result<u64> {
        let checkpoint: i64 = sqlx::query_scalar("SELECT checkpoint FROM workflow_runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(checkpoint as u64)
    }
}

fn summary_from_row(row: &SqliteRow) -> Result<RunSummary> {
    let status: String = row.try_get("status")?;
    let checkpoint: i64 = row.try_get("checkpoint")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(RunSummary {
        run_id: row.try_get("run_id")?,
        workflow_id: row.try_get("workflow_id")?,
        status: RunStatus::from_str(&status)?,
        checkpoint: checkpoint as u64,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    async fn save(&self, run: &WorkflowRun) -> Result<()> {
        debug!("Saving run {} at checkpoint {}", run.run_id, run.checkpoint);

        let state = serde_json::to_string(run)?;
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                run_id, workflow_id, status, checkpoint, state, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                checkpoint = excluded.checkpoint,
                state = excluded.state,
                updated_at = excluded.updated_at
            WHERE workflow_runs.checkpoint < excluded.checkpoint
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.workflow_id)
        .bind(run.status.to_string())
        .bind(run.checkpoint as i64)
        .bind(state)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::StaleCheckpoint {
                run_id: run.run_id.clone(),
                attempted: run.checkpoint,
                stored: self.stored_checkpoint(&run.run_id).await?,
            });
        }
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        debug!("Loading run {}", run_id);

        let state: Option<String> = sqlx::query_scalar("SELECT state FROM workflow_runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(state.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        debug!("Deleting run {}", run_id);

        sqlx::query("DELETE FROM workflow_runs WHERE run_id = ?1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, workflow_id: Option<&str>, limit: i64) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, workflow_id, status, checkpoint, created_at, updated_at
            FROM workflow_runs
            WHERE ?1 IS NULL OR workflow_id = ?1
            ORDER BY updated_at DESC
            LIMIT ?2
            "#,
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }
}
