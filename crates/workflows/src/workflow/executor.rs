use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::{
    metrics,
    workflow::{RunError, StepConfig, StepContext, StepDefinition, StepResponse},
    Error, Result,
};

/// Engine-wide fallbacks for settings a step does not configure.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDefaults {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_interval: Duration::from_millis(0),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success {
        response: StepResponse,
        attempts: u32,
    },
    Failed {
        error: RunError,
        attempts: u32,
    },
}

impl StepOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            StepOutcome::Success { attempts, .. } | StepOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Runs a single step's invoke or compensate function.
#[derive(Debug, Default)]
pub struct StepExecutor {
    defaults: StepDefaults,
}

impl StepExecutor {
    pub fn new(defaults: StepDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &StepDefaults {
        &self.defaults
    }

    /// Invoke `step` for node `node_id`, retrying failed attempts up to the
    /// configured bound. A timed-out attempt fails the step without a retry.
    /// Errors are captured in the outcome; nothing is propagated.
    pub async fn execute(
        &self,
        node_id: &str,
        step: &StepDefinition,
        config: &StepConfig,
        input: Value,
        ctx: StepContext,
    ) -> StepOutcome {
        let max_attempts = config.max_retries.unwrap_or(self.defaults.max_retries) + 1;
        let retry_interval = config.retry_interval.unwrap_or(self.defaults.retry_interval);
        let step_timeout = config.timeout.or(self.defaults.timeout);
        let started = Instant::now();
        let mut attempt = 1u32;

        loop {
            debug!("Invoking step {} (attempt {}/{})", node_id, attempt, max_attempts);
            let invocation = step.call_invoke(input.clone(), ctx.for_attempt(attempt));
            let result = match step_timeout {
                Some(limit) => match timeout(limit, guarded(invocation, node_id)).await {
                    Ok(result) => result,
                    Err(_) => {
                        error!("Step {} timed out after {:?}", node_id, limit);
                        metrics::record_step(&ctx.metadata.workflow_id, "timeout", started.elapsed());
                        let err = Error::StepTimeout {
                            step_id: node_id.to_string(),
                            timeout: limit,
                        };
                        return StepOutcome::Failed {
                            error: RunError::invoke(node_id, &err),
                            attempts: attempt,
                        };
                    }
                },
                None => guarded(invocation, node_id).await,
            };

            match result {
                Ok(response) => {
                    info!("Step {} completed successfully", node_id);
                    metrics::record_step(&ctx.metadata.workflow_id, "success", started.elapsed());
                    return StepOutcome::Success {
                        response,
                        attempts: attempt,
                    };
                }
                Err(e) if attempt >= max_attempts => {
                    error!("Step {} failed: {}", node_id, e);
                    metrics::record_step(&ctx.metadata.workflow_id, "failed", started.elapsed());
                    return StepOutcome::Failed {
                        error: RunError::invoke(node_id, &e),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!(
                        "Step {} attempt {}/{} failed: {}. Retrying in {:?}",
                        node_id,
                        attempt,
                        max_attempts,
                        e,
                        retry_interval * attempt
                    );
                    sleep(retry_interval * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run the compensation of `step`. A failure is logged and handed back
    /// for aggregation; the caller keeps unwinding.
    pub async fn compensate(
        &self,
        node_id: &str,
        step: &StepDefinition,
        input: Value,
        ctx: StepContext,
    ) -> std::result::Result<bool, RunError> {
        let workflow_id = ctx.metadata.workflow_id.clone();
        let Some(compensation) = step.call_compensate(input, ctx) else {
            return Ok(false);
        };

        info!("Compensating step {}", node_id);
        match guarded(compensation, node_id).await {
            Ok(()) => {
                metrics::record_compensation(&workflow_id, "success");
                Ok(true)
            }
            Err(e) => {
                error!("Compensation of step {} failed: {}", node_id, e);
                metrics::record_compensation(&workflow_id, "failed");
                let err = Error::Compensation {
                    step_id: node_id.to_string(),
                    message: e.to_string(),
                };
                Err(RunError::compensate(node_id, &err))
            }
        }
    }
}

/// Turn a panic inside a step into an ordinary step error.
async fn guarded<T, F>(future: F, node_id: &str) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "step panicked".to_string());
            Err(Error::StepExecution {
                step_id: node_id.to_string(),
                message,
            })
        }
    }
}
