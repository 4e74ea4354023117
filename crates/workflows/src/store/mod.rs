mod config;
mod factory;
mod memory;
mod models;
mod postgres;
mod sqlite;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::create_store;
pub use memory::MemoryRunStore;
pub use models::RunSummary;
pub use postgres::PostgresRunStore;
pub use sqlite::SqliteRunStore;

use async_trait::async_trait;

use crate::workflow::WorkflowRun;

/// Durable storage for workflow runs.
///
/// Every save carries the run's `checkpoint` number. Implementations must
/// reject a save whose number is not greater than the stored one with
/// [`crate::Error::StaleCheckpoint`], so that checkpoints of one run apply
/// in the order its transitions happened.
#[async_trait]
pub trait RunStore: Send + Sync {
    // Initialize database schema
    async fn init(&self) -> crate::Result<()>;

    async fn save(&self, run: &WorkflowRun) -> crate::Result<()>;
    async fn load(&self, run_id: &str) -> crate::Result<Option<WorkflowRun>>;
    async fn delete(&self, run_id: &str) -> crate::Result<()>;

    /// Most recently updated runs first.
    async fn list(&self, workflow_id: Option<&str>, limit: i64) -> crate::Result<Vec<RunSummary>>;
}
