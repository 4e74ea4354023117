pub mod config;
pub mod container;
pub mod flows;
pub mod links;
pub mod metrics;
pub mod modules;
pub mod remote_query;
pub mod store;
pub mod workflow;

use std::time::Duration;

use thiserror::Error;

use crate::workflow::{ErrorKind, RunFailure};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Step {step_id} failed: {message}")]
    StepExecution { step_id: String, message: String },
    #[error("Step {step_id} timed out after {timeout:?}")]
    StepTimeout { step_id: String, timeout: Duration },
    #[error("Compensation of step {step_id} failed: {message}")]
    Compensation { step_id: String, message: String },
    #[error("Cyclic graph: {0}")]
    CyclicGraph(String),
    #[error("Unknown step reference: {0}")]
    UnknownStepReference(String),
    #[error("Duplicate step id: {0}")]
    DuplicateStepId(String),
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Stale checkpoint for run {run_id}: {attempted} is not newer than {stored}")]
    StaleCheckpoint {
        run_id: String,
        attempted: u64,
        stored: u64,
    },
    #[error("Service not registered: {0}")]
    ServiceNotRegistered(&'static str),
    #[error("Not allowed: {0}")]
    NotAllowed(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Relation not found: {0}")]
    RelationNotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{}", .0.first)]
    RunFailed(Box<RunFailure>),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classification recorded on a run when this error escapes a step.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::StepTimeout { .. } => ErrorKind::StepTimeout,
            Error::Compensation { .. } => ErrorKind::Compensation,
            Error::NotAllowed(_) => ErrorKind::NotAllowed,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::RelationNotFound(_) => ErrorKind::RelationNotFound,
            Error::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::StepExecution,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
