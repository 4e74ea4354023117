//! Composition API that turns a composer closure into an immutable step graph.
//!
//! The closure passed to [`create_workflow`] runs exactly once. Every
//! `invoke`, `transform` and `when` call records a node and hands back a
//! [`Data`] reference to that node's future output; nothing is executed
//! until a run is started on the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;

use crate::{
    workflow::{Data, StepConfig, StepDefinition},
    Error, Result,
};

/// Id of the node holding the workflow input.
pub const INPUT_NODE: &str = "$input";

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

pub type TransformFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;
pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type InputValidator = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub enum NodeKind {
    Input,
    Step {
        step: Arc<StepDefinition>,
        config: StepConfig,
    },
    Transform(TransformFn),
    Condition(PredicateFn),
}

#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub input: Data,
    /// Condition node that must evaluate to `true` for this node to run.
    pub guard: Option<String>,
    /// Ordering prerequisites that carry no data.
    pub after: Vec<String>,
}

impl Node {
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self.input.references().into_iter().map(|(_, n)| n).collect();
        deps.extend(self.guard.as_deref());
        deps.extend(self.after.iter().map(String::as_str));
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    pub fn is_step(&self) -> bool {
        matches!(self.kind, NodeKind::Step { .. })
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            NodeKind::Input => "input".to_string(),
            NodeKind::Step { step, .. } => format!("step({})", step.id()),
            NodeKind::Transform(_) => "transform".to_string(),
            NodeKind::Condition(_) => "condition".to_string(),
        };
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("guard", &self.guard)
            .field("dependencies", &self.dependencies())
            .finish()
    }
}

#[derive(Debug)]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    /// Nodes in composition order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Ids of every node a run tracks state for.
    pub fn tracked_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|node| !matches!(node.kind, NodeKind::Input))
            .map(|node| node.id.as_str())
    }

    fn validate(&self, workflow_id: &str) -> Result<()> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let indices: HashMap<&str, NodeIndex> = self
            .nodes
            .iter()
            .map(|node| (node.id.as_str(), graph.add_node(node.id.as_str())))
            .collect();

        for node in &self.nodes {
            for dep in node.dependencies() {
                let from = indices.get(dep).ok_or_else(|| {
                    Error::UnknownStepReference(format!("{} (required by {})", dep, node.id))
                })?;
                graph.add_edge(*from, indices[node.id.as_str()], ());
            }
        }

        toposort(&graph, None).map(|_| ()).map_err(|cycle| {
            Error::CyclicGraph(format!(
                "workflow {} has a cycle through {}",
                workflow_id,
                graph[cycle.node_id()]
            ))
        })
    }
}

pub struct WorkflowDefinition {
    id: String,
    graph: Arc<WorkflowGraph>,
    result: Data,
    input_validator: Option<InputValidator>,
}

impl WorkflowDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    pub fn result(&self) -> &Data {
        &self.result
    }

    /// Reject malformed input before a run is created.
    pub fn with_input_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.input_validator = Some(Arc::new(validator));
        self
    }

    pub fn validate_input(&self, input: &Value) -> Result<()> {
        match &self.input_validator {
            Some(validator) => validator(input),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("nodes", &self.graph.nodes.len())
            .finish()
    }
}

pub struct WorkflowBuilder {
    workflow_id: String,
    scope: u64,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    guards: Vec<String>,
}

impl WorkflowBuilder {
    fn new(workflow_id: String) -> Self {
        let mut builder = Self {
            workflow_id,
            scope: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            index: HashMap::new(),
            guards: Vec::new(),
        };
        builder.index.insert(INPUT_NODE.to_string(), 0);
        builder.nodes.push(Node {
            id: INPUT_NODE.to_string(),
            kind: NodeKind::Input,
            input: Data::null(),
            guard: None,
            after: Vec::new(),
        });
        builder
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn input(&self) -> Data {
        Data::node(self.scope, INPUT_NODE)
    }

    pub fn invoke(&mut self, step: &StepDefinition, input: impl Into<Data>) -> Result<Data> {
        self.invoke_with(step, input, StepConfig::default())
    }

    /// Invoke with per-call overrides. A `name` override gives the node its
    /// own id, which is how one step runs twice in the same workflow.
    pub fn invoke_with(
        &mut self,
        step: &StepDefinition,
        input: impl Into<Data>,
        config: StepConfig,
    ) -> Result<Data> {
        let config = step.config().merged(&config);
        let node_id = config.name.clone().unwrap_or_else(|| step.id().to_string());
        self.add_node(
            node_id,
            NodeKind::Step {
                step: Arc::new(step.clone()),
                config,
            },
            input.into(),
        )
    }

    pub fn transform<F>(&mut self, name: &str, input: impl Into<Data>, transform: F) -> Result<Data>
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.add_node(
            name.to_string(),
            NodeKind::Transform(Arc::new(transform)),
            input.into(),
        )
    }

    /// Nodes recorded inside `body` only run when `predicate` holds for the
    /// resolved `input`; otherwise they are skipped and resolve to `null`.
    pub fn when<P, B>(&mut self, name: &str, input: impl Into<Data>, predicate: P, body: B) -> Result<Data>
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
        B: FnOnce(&mut Self) -> Result<Data>,
    {
        self.add_node(
            name.to_string(),
            NodeKind::Condition(Arc::new(predicate)),
            input.into(),
        )?;
        self.guards.push(name.to_string());
        let result = body(self);
        self.guards.pop();
        result
    }

    /// Order `node` after `prerequisites` without passing data between them.
    pub fn after(&mut self, node: &Data, prerequisites: &[&Data]) -> Result<()> {
        let target = self.own_node(node)?;
        let mut ids = Vec::with_capacity(prerequisites.len());
        for prerequisite in prerequisites {
            ids.push(self.own_node(prerequisite)?);
        }
        let position = self.index[&target];
        self.nodes[position].after.extend(ids);
        Ok(())
    }

    fn own_node(&self, data: &Data) -> Result<String> {
        match data.as_node() {
            Some((scope, id)) if scope == self.scope && self.index.contains_key(id) => Ok(id.to_string()),
            _ => Err(Error::UnknownStepReference(format!(
                "{:?} is not a node of workflow {}",
                data, self.workflow_id
            ))),
        }
    }

    fn check_references(&self, data: &Data, referenced_by: &str) -> Result<()> {
        for (scope, node) in data.references() {
            if scope != self.scope || !self.index.contains_key(node) {
                return Err(Error::UnknownStepReference(format!(
                    "{} (referenced by {} in workflow {})",
                    node, referenced_by, self.workflow_id
                )));
            }
        }
        Ok(())
    }

    fn add_node(&mut self, id: String, kind: NodeKind, input: Data) -> Result<Data> {
        if self.index.contains_key(&id) {
            return Err(Error::DuplicateStepId(id));
        }
        self.check_references(&input, &id)?;

        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(Node {
            id: id.clone(),
            kind,
            input,
            guard: self.guards.last().cloned(),
            after: Vec::new(),
        });
        Ok(Data::node(self.scope, id))
    }

    pub fn build(self, result: Data) -> Result<WorkflowDefinition> {
        self.check_references(&result, "the workflow result")?;
        let graph = WorkflowGraph {
            nodes: self.nodes,
            index: self.index,
        };
        graph.validate(&self.workflow_id)?;

        Ok(WorkflowDefinition {
            id: self.workflow_id,
            graph: Arc::new(graph),
            result,
            input_validator: None,
        })
    }
}

/// Compose a workflow. `composer` receives the builder and a reference to the
/// run input, and returns the expression the run resolves to.
pub fn create_workflow<F>(id: impl Into<String>, composer: F) -> Result<WorkflowDefinition>
where
    F: FnOnce(&mut WorkflowBuilder, Data) -> Result<Data>,
{
    let mut builder = WorkflowBuilder::new(id.into());
    let input = builder.input();
    let result = composer(&mut builder, input)?;
    builder.build(result)
}
