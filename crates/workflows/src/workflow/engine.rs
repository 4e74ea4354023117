use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    container::Container,
    metrics,
    store::RunStore,
    workflow::{
        ExecutionContext, Node, NodeKind, RunError, RunFailure, RunStatus, StepExecutor, StepOutcome,
        StepStatus, WorkflowDefinition, WorkflowResult, WorkflowRun,
    },
    Error, Result,
};

/// How a caller starts a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: Value,
    /// Becomes the run id. Starting a run whose id already exists returns the
    /// stored run instead of executing again.
    pub transaction_id: Option<String>,
    /// Return `Err(Error::RunFailed)` instead of a result carrying errors.
    pub throw_on_error: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            input: Value::Null,
            transaction_id: None,
            throw_on_error: true,
        }
    }
}

impl RunOptions {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = throw;
        self
    }
}

/// A step invocation running on its own task, so it keeps making progress
/// while the driver awaits a checkpoint. Dropping it aborts the task.
struct InFlight {
    node_id: String,
    handle: JoinHandle<StepOutcome>,
}

impl InFlight {
    fn spawn<F>(node_id: String, invocation: F) -> Self
    where
        F: Future<Output = StepOutcome> + Send + 'static,
    {
        Self {
            node_id,
            handle: tokio::spawn(invocation),
        }
    }
}

impl Future for InFlight {
    type Output = (String, StepOutcome);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.handle).poll(cx).map(|joined| {
            let outcome = joined.unwrap_or_else(|e| StepOutcome::Failed {
                error: RunError::invoke(
                    &this.node_id,
                    &Error::Internal(format!("step task ended abnormally: {}", e)),
                ),
                attempts: 1,
            });
            (this.node_id.clone(), outcome)
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs registered workflows and drives their state machine.
pub struct WorkflowEngine {
    store: Arc<dyn RunStore>,
    executor: Arc<StepExecutor>,
    container: Arc<Container>,
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn RunStore>, executor: Arc<StepExecutor>, container: Arc<Container>) -> Self {
        metrics::register_metrics();
        Self {
            store,
            executor,
            container,
            workflows: RwLock::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub async fn register(&self, definition: WorkflowDefinition) -> Result<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(definition.id()) {
            return Err(Error::Validation(format!(
                "Workflow {} is already registered",
                definition.id()
            )));
        }
        info!("Registered workflow {}", definition.id());
        workflows.insert(definition.id().to_string(), Arc::new(definition));
        Ok(())
    }

    pub async fn workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    pub async fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn definition(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.workflow(workflow_id)
            .await
            .ok_or_else(|| Error::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Start a run of `workflow_id` and drive it until it finishes or
    /// suspends on a long-running step.
    pub async fn run(&self, workflow_id: &str, options: RunOptions) -> Result<WorkflowResult> {
        let definition = self.definition(workflow_id).await?;
        definition.validate_input(&options.input)?;

        let run_id = options
            .transaction_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let lock = self.run_lock(&run_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.start_run(&definition, run_id.clone(), options).await
        };
        self.release_run_lock(&run_id, lock).await;
        result
    }

    async fn start_run(
        &self,
        definition: &Arc<WorkflowDefinition>,
        run_id: String,
        options: RunOptions,
    ) -> Result<WorkflowResult> {
        if options.transaction_id.is_some() {
            if let Some(existing) = self.store.load(&run_id).await? {
                if existing.workflow_id != definition.id() {
                    return Err(Error::Validation(format!(
                        "Transaction {} belongs to workflow {}",
                        run_id, existing.workflow_id
                    )));
                }
                info!("Run {} already exists, returning its stored state", run_id);
                return finish(&existing, options.throw_on_error);
            }
        }

        let mut run = WorkflowRun::new(
            run_id,
            definition.id().to_string(),
            options.input,
            definition.graph().tracked_ids(),
        );
        run.idempotency_key = options.transaction_id;
        self.checkpoint(&mut run).await?;
        run.transition(RunStatus::Running)?;
        self.checkpoint(&mut run).await?;

        info!("Starting run {} of workflow {}", run.run_id, run.workflow_id);
        metrics::record_run_started(&run.workflow_id);

        let context = ExecutionContext::from_run(self.container.clone(), &run);
        self.drive(definition, &mut run, context).await?;
        finish(&run, options.throw_on_error)
    }

    /// Complete a waiting long-running step with `output` and continue the run.
    pub async fn set_step_success(&self, run_id: &str, node_id: &str, output: Value) -> Result<WorkflowResult> {
        self.signal(run_id, node_id, Ok(output)).await
    }

    /// Fail a waiting long-running step, which fails and reverts the run.
    pub async fn set_step_failure(
        &self,
        run_id: &str,
        node_id: &str,
        message: impl Into<String>,
    ) -> Result<WorkflowResult> {
        self.signal(run_id, node_id, Err(message.into())).await
    }

    async fn signal(
        &self,
        run_id: &str,
        node_id: &str,
        outcome: std::result::Result<Value, String>,
    ) -> Result<WorkflowResult> {
        let lock = self.run_lock(run_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply_signal(run_id, node_id, outcome).await
        };
        self.release_run_lock(run_id, lock).await;
        result
    }

    async fn apply_signal(
        &self,
        run_id: &str,
        node_id: &str,
        outcome: std::result::Result<Value, String>,
    ) -> Result<WorkflowResult> {
        let mut run = self.load_run(run_id).await?;
        let definition = self.definition(&run.workflow_id).await?;

        if run.status != RunStatus::Running {
            return Err(Error::InvalidTransition(format!(
                "run {} is {}, signals are only accepted while running",
                run_id, run.status
            )));
        }
        let state = run.step_mut(node_id)?;
        if state.status != StepStatus::Waiting {
            return Err(Error::InvalidTransition(format!(
                "step {} of run {} is {}, not waiting",
                node_id, run_id, state.status
            )));
        }

        state.completed_at = Some(Utc::now());
        match outcome {
            Ok(output) => {
                info!("Step {} of run {} signalled success", node_id, run_id);
                state.status = StepStatus::Success;
                state.output = Some(output);
                run.completion_order.retain(|id| id != node_id);
                run.completion_order.push(node_id.to_string());
            }
            Err(message) => {
                warn!("Step {} of run {} signalled failure: {}", node_id, run_id, message);
                let error = RunError::invoke(
                    node_id,
                    &Error::StepExecution {
                        step_id: node_id.to_string(),
                        message,
                    },
                );
                state.status = StepStatus::Failed;
                state.error = Some(error.clone());
                run.errors.push(error);
            }
        }
        self.checkpoint(&mut run).await?;

        let context = ExecutionContext::from_run(self.container.clone(), &run);
        self.drive(&definition, &mut run, context).await?;
        Ok(WorkflowResult::from_run(&run))
    }

    /// Continue a persisted run, e.g. after a process restart. Nodes that
    /// were in flight when the previous process stopped count as failed.
    pub async fn resume(&self, run_id: &str) -> Result<WorkflowResult> {
        let lock = self.run_lock(run_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.resume_locked(run_id).await
        };
        self.release_run_lock(run_id, lock).await;
        result
    }

    async fn resume_locked(&self, run_id: &str) -> Result<WorkflowResult> {
        let mut run = self.load_run(run_id).await?;
        if run.is_terminal() {
            return Ok(WorkflowResult::from_run(&run));
        }
        let definition = self.definition(&run.workflow_id).await?;
        info!("Resuming run {} of workflow {} ({})", run.run_id, run.workflow_id, run.status);

        if run.status == RunStatus::Pending {
            run.transition(RunStatus::Running)?;
            self.checkpoint(&mut run).await?;
        }

        let interrupted: Vec<String> = run
            .steps
            .iter()
            .filter(|(_, state)| state.status == StepStatus::Running)
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in interrupted {
            let error = RunError::invoke(
                &node_id,
                &Error::StepExecution {
                    step_id: node_id.clone(),
                    message: "interrupted before completion".to_string(),
                },
            );
            let state = run.step_mut(&node_id)?;
            state.status = StepStatus::Failed;
            state.error = Some(error.clone());
            state.completed_at = Some(Utc::now());
            run.errors.push(error);
        }

        let context = ExecutionContext::from_run(self.container.clone(), &run);
        if run.status == RunStatus::Failed {
            self.compensate(&definition, &mut run, &context).await?;
        } else {
            self.checkpoint(&mut run).await?;
            self.drive(&definition, &mut run, context).await?;
        }
        Ok(WorkflowResult::from_run(&run))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        self.store.load(run_id).await
    }

    async fn load_run(&self, run_id: &str) -> Result<WorkflowRun> {
        self.store
            .load(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Run {} was not found", run_id)))
    }

    /// Schedule ready nodes, apply completions one at a time and settle the
    /// run once nothing is left to do.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        mut context: ExecutionContext,
    ) -> Result<()> {
        let graph = definition.graph().clone();
        let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();
        let mut failed = run.steps.values().any(|s| s.status == StepStatus::Failed);

        loop {
            if !failed {
                failed = self.schedule(graph.nodes(), run, &mut context, &mut in_flight).await?;
            }

            let Some((node_id, outcome)) = in_flight.next().await else {
                break;
            };
            let is_async = graph
                .node(&node_id)
                .map(|node| matches!(&node.kind, NodeKind::Step { config, .. } if config.is_async_step()))
                .unwrap_or(false);

            let state = run.step_mut(&node_id)?;
            state.attempts = outcome.attempts();
            match outcome {
                StepOutcome::Success { response, .. } => {
                    state.compensate_input = response.compensate_input;
                    state.output = Some(response.output.clone());
                    if is_async {
                        state.status = StepStatus::Waiting;
                        debug!("Step {} of run {} is waiting for a signal", node_id, run.run_id);
                    } else {
                        state.status = StepStatus::Success;
                        state.completed_at = Some(Utc::now());
                        context.add_step_output(&node_id, response.output);
                    }
                    run.completion_order.push(node_id);
                }
                StepOutcome::Failed { error, .. } => {
                    state.status = StepStatus::Failed;
                    state.error = Some(error.clone());
                    state.completed_at = Some(Utc::now());
                    run.errors.push(error);
                    if !failed {
                        warn!("Run {} failed at step {}, draining in-flight steps", run.run_id, node_id);
                    }
                    failed = true;
                }
            }
            self.checkpoint(run).await?;
        }

        if failed {
            run.transition(RunStatus::Failed)?;
            self.checkpoint(run).await?;
            return self.compensate(definition, run, &context).await;
        }

        let waiting = run.waiting_steps();
        if !waiting.is_empty() {
            info!("Run {} suspended on {:?}", run.run_id, waiting);
            return Ok(());
        }

        if let Some((node_id, _)) = run
            .steps
            .iter()
            .find(|(_, state)| !state.status.unlocks_dependents())
        {
            return Err(Error::Internal(format!(
                "run {} stalled with node {} unfinished",
                run.run_id, node_id
            )));
        }

        run.result = Some(context.resolve(definition.result())?);
        run.transition(RunStatus::Done)?;
        self.checkpoint(run).await?;
        info!("Run {} of workflow {} completed", run.run_id, run.workflow_id);
        metrics::record_run_finished(&run.workflow_id, "done");
        Ok(())
    }

    /// Start every node whose prerequisites are met. Transforms and
    /// conditions run inline, which may unlock further nodes, so this loops
    /// until no node changes. Returns `true` once a node has failed.
    async fn schedule(
        &self,
        nodes: &[Node],
        run: &mut WorkflowRun,
        context: &mut ExecutionContext,
        in_flight: &mut FuturesUnordered<InFlight>,
    ) -> Result<bool> {
        loop {
            let mut progressed = false;
            for node in nodes {
                if matches!(node.kind, NodeKind::Input) || !is_ready(node, run) {
                    continue;
                }
                progressed = true;

                let guard_open = node
                    .guard
                    .as_deref()
                    .map_or(true, |guard| context.lookup(guard) == Some(&Value::Bool(true)));
                if !guard_open {
                    debug!("Skipping node {} of run {}", node.id, run.run_id);
                    let state = run.step_mut(&node.id)?;
                    state.status = StepStatus::Skipped;
                    state.completed_at = Some(Utc::now());
                    context.add_step_output(&node.id, Value::Null);
                    self.checkpoint(run).await?;
                    continue;
                }

                let input = context.resolve(&node.input);
                let outcome = match (&node.kind, input) {
                    (_, Err(e)) => Err(e),
                    (NodeKind::Transform(transform), Ok(input)) => transform(input),
                    (NodeKind::Condition(predicate), Ok(input)) => Ok(Value::Bool(predicate(&input))),
                    (NodeKind::Step { step, config }, Ok(input)) => {
                        let state = run.step_mut(&node.id)?;
                        state.status = StepStatus::Running;
                        state.started_at = Some(Utc::now());
                        self.checkpoint(run).await?;

                        let executor = self.executor.clone();
                        let step = step.clone();
                        let config = config.clone();
                        let node_id = node.id.clone();
                        let ctx = context.step_context(&node.id, 1);
                        in_flight.push(InFlight::spawn(node_id.clone(), async move {
                            executor.execute(&node_id, &step, &config, input, ctx).await
                        }));
                        continue;
                    }
                    (NodeKind::Input, Ok(_)) => continue,
                };

                if let Err(e) = &outcome {
                    error!("Node {} of run {} failed: {}", node.id, run.run_id, e);
                }
                let state = run.step_mut(&node.id)?;
                state.started_at = Some(Utc::now());
                state.completed_at = state.started_at;
                state.attempts = 1;
                match outcome {
                    Ok(output) => {
                        state.status = StepStatus::Success;
                        state.output = Some(output.clone());
                        context.add_step_output(&node.id, output);
                        self.checkpoint(run).await?;
                    }
                    Err(e) => {
                        let error = RunError::invoke(&node.id, &e);
                        state.status = StepStatus::Failed;
                        state.error = Some(error.clone());
                        run.errors.push(error);
                        self.checkpoint(run).await?;
                        return Ok(true);
                    }
                }
            }
            if !progressed {
                return Ok(false);
            }
        }
    }

    /// Unwind every step whose invoke succeeded, newest first. A failed
    /// compensation is recorded and the unwind continues.
    async fn compensate(
        &self,
        definition: &WorkflowDefinition,
        run: &mut WorkflowRun,
        context: &ExecutionContext,
    ) -> Result<()> {
        info!("Compensating run {} of workflow {}", run.run_id, run.workflow_id);
        let order: Vec<String> = run.completion_order.iter().rev().cloned().collect();

        for node_id in order {
            let Some(NodeKind::Step { step, .. }) = definition.graph().node(&node_id).map(|n| &n.kind) else {
                continue;
            };
            let Some(state) = run.step(&node_id) else {
                continue;
            };
            if !matches!(state.status, StepStatus::Success | StepStatus::Waiting) || !step.has_compensation() {
                continue;
            }
            let input = state
                .compensate_input
                .clone()
                .or_else(|| state.output.clone())
                .unwrap_or(Value::Null);

            let result = self
                .executor
                .compensate(&node_id, step, input, context.step_context(&node_id, 1))
                .await;
            let state = run.step_mut(&node_id)?;
            match result {
                Ok(_) => state.status = StepStatus::Compensated,
                Err(error) => {
                    state.status = StepStatus::CompensationFailed;
                    state.error = Some(error.clone());
                    run.errors.push(error);
                }
            }
            self.checkpoint(run).await?;
        }

        run.transition(RunStatus::Reverted)?;
        self.checkpoint(run).await?;
        info!("Run {} of workflow {} reverted", run.run_id, run.workflow_id);
        metrics::record_run_finished(&run.workflow_id, "reverted");
        Ok(())
    }

    /// Persist the run under the next checkpoint number. A refused save
    /// aborts the transition that produced it.
    async fn checkpoint(&self, run: &mut WorkflowRun) -> Result<()> {
        run.checkpoint += 1;
        run.updated_at = Utc::now();
        if let Err(e) = self.store.save(run).await {
            error!("Failed to checkpoint run {} at {}: {}", run.run_id, run.checkpoint, e);
            metrics::record_checkpoint_failure();
            return Err(e);
        }
        Ok(())
    }

    async fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.run_locks
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .clone()
    }

    async fn release_run_lock(&self, run_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.run_locks.lock().await;
        drop(lock);
        if locks.get(run_id).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(run_id);
        }
    }
}

fn is_ready(node: &Node, run: &WorkflowRun) -> bool {
    if run.step(&node.id).map(|s| s.status) != Some(StepStatus::Pending) {
        return false;
    }
    node.dependencies().into_iter().all(|dep| match run.step(dep) {
        Some(state) => state.status.unlocks_dependents(),
        None => true,
    })
}

fn finish(run: &WorkflowRun, throw_on_error: bool) -> Result<WorkflowResult> {
    if throw_on_error {
        if let Some(first) = run.primary_error() {
            return Err(Error::RunFailed(Box::new(RunFailure {
                run_id: run.run_id.clone(),
                first: first.clone(),
                errors: run.errors.clone(),
            })));
        }
    }
    Ok(WorkflowResult::from_run(run))
}
