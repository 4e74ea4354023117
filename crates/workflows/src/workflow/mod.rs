pub mod builder;
pub mod context;
pub mod data;
pub mod engine;
pub mod executor;
pub mod run;
pub mod state;
pub mod step;

pub use builder::{create_workflow, Node, NodeKind, WorkflowBuilder, WorkflowDefinition, WorkflowGraph, INPUT_NODE};
pub use context::{ExecutionContext, RunMetadata, StepContext};
pub use data::{Data, PathSegment};
pub use engine::{RunOptions, WorkflowEngine};
pub use executor::{StepDefaults, StepExecutor, StepOutcome};
pub use run::{ErrorKind, RunError, RunFailure, StepAction, StepState, WorkflowResult, WorkflowRun};
pub use state::{RunStatus, StepStatus};
pub use step::{
    create_step, parse_input, CompensateFn, InvokeFn, StepConfig, StepDefinition, StepRegistry, StepResponse,
};
