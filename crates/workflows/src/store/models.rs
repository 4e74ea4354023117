use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::{RunStatus, WorkflowRun};

/// One row of a run listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub checkpoint: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowRun> for RunSummary {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            status: run.status,
            checkpoint: run.checkpoint,
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}
