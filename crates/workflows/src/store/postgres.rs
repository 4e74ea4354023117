use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, error, info};

use crate::{
    store::{RunStore, RunSummary},
    workflow::{RunStatus, WorkflowRun},
    Error, Result,
};

pub struct PostgresRunStore {
    pool: Pool<Postgres>,
}

impl PostgresRunStore {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to PostgreSQL database");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                Error::Sqlx(e)
            })?;

        Ok(Self { pool })
    }
}

fn summary_from_row(row: &PgRow) -> Result<RunSummary> {
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
impl RunStore for PostgresRunStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations/postgres")
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

        let state = serde_json::to_value(run)?;
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                run_id, workflow_id, status, checkpoint, state, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id) DO UPDATE SET
                status = EXCLUDED.status,
                checkpoint = EXCLUDED.checkpoint,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            WHERE workflow_runs.checkpoint < EXCLUDED.checkpoint
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.workflow_id)
        .bind(run.status.to_string())
        .bind(run.checkpoint as i64)
        .bind(sqlx::types::Json(state))
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let stored: i64 = sqlx::query_scalar("SELECT checkpoint FROM workflow_runs WHERE run_id = $1")
                .bind(&run.run_id)
                .fetch_one(&self.pool)
                .await?;
            return Err(Error::StaleCheckpoint {
                run_id: run.run_id.clone(),
                attempted: run.checkpoint,
                stored: stored as u64,
            });
        }
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        debug!("Loading run {}", run_id);

        let state: Option<sqlx::types::Json<serde_json::Value>> =
            sqlx::query_scalar("SELECT state FROM workflow_runs WHERE run_id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(state.map(|s| serde_json::from_value(s.0)).transpose()?)
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        debug!("Deleting run {}", run_id);

        sqlx::query("DELETE FROM workflow_runs WHERE run_id = $1")
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
            WHERE $1::TEXT IS NULL OR workflow_id = $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }
}
