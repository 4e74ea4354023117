use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    container::Container,
    modules::SharedContext,
    workflow::{Data, StepStatus, WorkflowRun, INPUT_NODE},
    Result,
};

/// Identifiers of the run a step executes in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub workflow_id: String,
    /// Caller-supplied transaction id, when the run was started with one.
    pub idempotency_key: Option<String>,
}

/// Per-run execution state: input, outputs of completed nodes and the shared container.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    container: Arc<Container>,
    metadata: RunMetadata,

    /// The initial input to the workflow
    input: Value,

    /// Outputs from each completed node
    step_outputs: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(container: Arc<Container>, metadata: RunMetadata, input: Value) -> Self {
        Self {
            container,
            metadata,
            input,
            step_outputs: HashMap::new(),
        }
    }

    /// Rebuild the context of a persisted run.
    pub fn from_run(container: Arc<Container>, run: &WorkflowRun) -> Self {
        let mut context = Self::new(
            container,
            RunMetadata {
                run_id: run.run_id.clone(),
                workflow_id: run.workflow_id.clone(),
                idempotency_key: run.idempotency_key.clone(),
            },
            run.input.clone(),
        );
        for (node_id, state) in &run.steps {
            match state.status {
                StepStatus::Skipped => context.add_step_output(node_id, Value::Null),
                StepStatus::Success
                | StepStatus::Compensated
                | StepStatus::CompensationFailed => {
                    context.add_step_output(node_id, state.output.clone().unwrap_or(Value::Null))
                }
                _ => {}
            }
        }
        context
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn add_step_output(&mut self, node_id: &str, output: Value) {
        self.step_outputs.insert(node_id.to_string(), output);
    }

    pub fn get_step_output(&self, node_id: &str) -> Option<&Value> {
        self.step_outputs.get(node_id)
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.step_outputs
    }

    /// Output of `node_id`, or the run input for [`INPUT_NODE`].
    pub fn lookup(&self, node_id: &str) -> Option<&Value> {
        if node_id == INPUT_NODE {
            Some(&self.input)
        } else {
            self.step_outputs.get(node_id)
        }
    }

    /// Resolve a symbolic expression against what the run has produced so far.
    pub fn resolve(&self, data: &Data) -> Result<Value> {
        let lookup = |node_id: &str| self.lookup(node_id);
        data.resolve(&lookup)
    }

    pub fn step_context(&self, step_id: &str, attempt: u32) -> StepContext {
        StepContext {
            container: self.container.clone(),
            metadata: self.metadata.clone(),
            step_id: step_id.to_string(),
            attempt,
        }
    }
}

/// What a step's invoke and compensate functions receive besides their input.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub container: Arc<Container>,
    pub metadata: RunMetadata,
    pub step_id: String,
    pub attempt: u32,
}

impl StepContext {
    pub fn resolve<T>(&self) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.container.resolve::<T>()
    }

    /// Context passed explicitly to module service calls.
    pub fn shared(&self) -> SharedContext {
        SharedContext {
            transaction_id: Some(self.metadata.run_id.clone()),
            workflow_id: Some(self.metadata.workflow_id.clone()),
        }
    }

    pub(crate) fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}
