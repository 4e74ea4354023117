//! Step definitions and the registry that scopes their ids.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{workflow::StepContext, Error, Result};

pub type InvokeFn =
    Arc<dyn Fn(Value, StepContext) -> BoxFuture<'static, Result<StepResponse>> + Send + Sync>;
pub type CompensateFn =
    Arc<dyn Fn(Value, StepContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Output of a step, plus what its compensation should receive.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResponse {
    pub output: Value,
    pub compensate_input: Option<Value>,
}

impl StepResponse {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            compensate_input: None,
        }
    }

    pub fn with_compensation(output: Value, compensate_input: Value) -> Self {
        Self {
            output,
            compensate_input: Some(compensate_input),
        }
    }

    pub fn empty() -> Self {
        Self::new(Value::Null)
    }
}

/// Per-invocation settings. Unset fields fall back to the step's own
/// config and then to the engine defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepConfig {
    pub name: Option<String>,
    pub max_retries: Option<u32>,
    pub retry_interval: Option<Duration>,
    pub timeout: Option<Duration>,
    /// Completes through an external signal rather than its invoke return.
    pub is_async: Option<bool>,
}

impl StepConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn async_step(mut self) -> Self {
        self.is_async = Some(true);
        self
    }

    /// `overrides` wins wherever it sets a field.
    pub fn merged(&self, overrides: &StepConfig) -> StepConfig {
        StepConfig {
            name: overrides.name.clone().or_else(|| self.name.clone()),
            max_retries: overrides.max_retries.or(self.max_retries),
            retry_interval: overrides.retry_interval.or(self.retry_interval),
            timeout: overrides.timeout.or(self.timeout),
            is_async: overrides.is_async.or(self.is_async),
        }
    }

    pub fn is_async_step(&self) -> bool {
        self.is_async.unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct StepDefinition {
    id: String,
    invoke: InvokeFn,
    compensate: Option<CompensateFn>,
    config: StepConfig,
}

impl StepDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    pub fn compensate<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |input, ctx| compensate(input, ctx).boxed()));
        self
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn call_invoke(&self, input: Value, ctx: StepContext) -> BoxFuture<'static, Result<StepResponse>> {
        (self.invoke)(input, ctx)
    }

    pub(crate) fn call_compensate(&self, input: Value, ctx: StepContext) -> Option<BoxFuture<'static, Result<()>>> {
        self.compensate.as_ref().map(|compensate| compensate(input, ctx))
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("compensate", &self.compensate.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// Define a step. Nothing runs until a workflow using it is executed.
pub fn create_step<F, Fut>(id: impl Into<String>, invoke: F) -> StepDefinition
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepResponse>> + Send + 'static,
{
    StepDefinition {
        id: id.into(),
        invoke: Arc::new(move |input, ctx| invoke(input, ctx).boxed()),
        compensate: None,
        config: StepConfig::default(),
    }
}

/// Deserialize a step input, reporting shape mismatches as validation errors.
pub fn parse_input<T: DeserializeOwned>(step_id: &str, input: Value) -> Result<T> {
    serde_json::from_value(input)
        .map_err(|e| Error::Validation(format!("Invalid input for step {}: {}", step_id, e)))
}

/// A scope in which step ids must be unique.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: HashMap<String, StepDefinition>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: StepDefinition) -> Result<StepDefinition> {
        if self.steps.contains_key(step.id()) {
            return Err(Error::DuplicateStepId(step.id().to_string()));
        }
        self.steps.insert(step.id().to_string(), step.clone());
        Ok(step)
    }

    pub fn create_step<F, Fut>(&mut self, id: impl Into<String>, invoke: F) -> Result<StepDefinition>
    where
        F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResponse>> + Send + 'static,
    {
        self.register(create_step(id, invoke))
    }

    pub fn get(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.get(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
