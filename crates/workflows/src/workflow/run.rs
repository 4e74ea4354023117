use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    workflow::{RunStatus, StepStatus},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StepExecution,
    StepTimeout,
    Compensation,
    NotAllowed,
    NotFound,
    RelationNotFound,
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Invoke,
    Compensate,
}

/// A step-level error captured on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub step_id: String,
    pub action: StepAction,
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn invoke(step_id: &str, error: &Error) -> Self {
        Self {
            step_id: step_id.to_string(),
            action: StepAction::Invoke,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn compensate(step_id: &str, error: &Error) -> Self {
        Self {
            step_id: step_id.to_string(),
            action: StepAction::Compensate,
            kind: ErrorKind::Compensation,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate_input: Option<Value>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepState {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            output: None,
            compensate_input: None,
            attempts: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Durable state of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_id: String,
    pub input: Value,
    /// Caller-supplied transaction id the run was started with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub status: RunStatus,
    pub steps: BTreeMap<String, StepState>,
    /// Step nodes in the order their invoke completed.
    pub completion_order: Vec<String>,
    pub errors: Vec<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Sequence number of the last persisted checkpoint.
    pub checkpoint: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new<I, S>(run_id: String, workflow_id: String, input: Value, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            run_id,
            workflow_id,
            input,
            idempotency_key: None,
            status: RunStatus::Pending,
            steps: node_ids
                .into_iter()
                .map(|id| (id.into(), StepState::pending()))
                .collect(),
            completion_order: Vec::new(),
            errors: Vec::new(),
            result: None,
            checkpoint: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.get(step_id)
    }

    pub(crate) fn step_mut(&mut self, step_id: &str) -> Result<&mut StepState> {
        self.steps
            .get_mut(step_id)
            .ok_or_else(|| Error::UnknownStepReference(step_id.to_string()))
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!(
                "run {} cannot move from {} to {}",
                self.run_id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn waiting_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, state)| state.status == StepStatus::Waiting)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// First invoke-side error, falling back to the first error of any kind.
    pub fn primary_error(&self) -> Option<&RunError> {
        self.errors
            .iter()
            .find(|e| e.action == StepAction::Invoke)
            .or_else(|| self.errors.first())
    }
}

/// What a caller of `run` gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub errors: Vec<RunError>,
}

impl WorkflowResult {
    pub fn from_run(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            result: run.result.clone(),
            errors: run.errors.clone(),
        }
    }

    /// True when the run stopped on a long-running step.
    pub fn is_suspended(&self) -> bool {
        self.status == RunStatus::Running
    }
}

/// Carried by [`Error::RunFailed`] when the caller asked for errors to be thrown.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFailure {
    pub run_id: String,
    pub first: RunError,
    /// Every error recorded on the run, compensation failures included.
    pub errors: Vec<RunError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_to_json_and_back() {
        let mut run = WorkflowRun::new(
            "run_1".into(),
            "wf".into(),
            json!({"a": 1}),
            ["first", "second"],
        );
        run.transition(RunStatus::Running).unwrap();
        let state = run.step_mut("first").unwrap();
        state.status = StepStatus::Success;
        state.output = Some(json!({"id": "x"}));
        run.completion_order.push("first".into());

        let encoded = serde_json::to_string(&run).unwrap();
        let decoded: WorkflowRun = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, run);
    }

    #[test]
    fn rejects_illegal_transitions() {
        let mut run = WorkflowRun::new("r".into(), "wf".into(), Value::Null, Vec::<String>::new());
        assert!(matches!(
            run.transition(RunStatus::Done),
            Err(Error::InvalidTransition(_))
        ));
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Failed).unwrap();
        run.transition(RunStatus::Reverted).unwrap();
        assert!(run.is_terminal());
    }

    #[test]
    fn primary_error_prefers_invoke_failures() {
        let mut run = WorkflowRun::new("r".into(), "wf".into(), Value::Null, ["a"]);
        run.errors.push(RunError::compensate(
            "a",
            &Error::Internal("cleanup".into()),
        ));
        run.errors
            .push(RunError::invoke("b", &Error::NotAllowed("nope".into())));
        let primary = run.primary_error().unwrap();
        assert_eq!(primary.step_id, "b");
        assert_eq!(primary.kind, ErrorKind::NotAllowed);
    }
}
