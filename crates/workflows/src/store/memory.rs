use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    store::{RunStore, RunSummary},
    workflow::WorkflowRun,
    Error, Result,
};

/// Process-local store. Runs are kept serialized so a loaded run never
/// shares state with the engine that saved it.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, (RunSummary, String)>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, run: &WorkflowRun) -> Result<()> {
        debug!("Saving run {} at checkpoint {}", run.run_id, run.checkpoint);
        let state = serde_json::to_string(run)?;

        let mut runs = self.runs.write().await;
        if let Some((stored, _)) = runs.get(&run.run_id) {
            if stored.checkpoint >= run.checkpoint {
                return Err(Error::StaleCheckpoint {
                    run_id: run.run_id.clone(),
                    attempted: run.checkpoint,
                    stored: stored.checkpoint,
                });
            }
        }
        runs.insert(run.run_id.clone(), (RunSummary::from(run), state));
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        debug!("Loading run {}", run_id);
        let runs = self.runs.read().await;
        runs.get(run_id)
            .map(|(_, state)| serde_json::from_str(state).map_err(Error::from))
            .transpose()
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        debug!("Deleting run {}", run_id);
        self.runs.write().await.remove(run_id);
        Ok(())
    }

    async fn list(&self, workflow_id: Option<&str>, limit: i64) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut summaries: Vec<RunSummary> = runs
            .values()
            .map(|(summary, _)| summary)
            .filter(|summary| workflow_id.map_or(true, |id| summary.workflow_id == id))
            .cloned()
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit.max(0) as usize);
        Ok(summaries)
    }
}
