use std::sync::Once;
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

use crate::{Error, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref WORKFLOW_RUNS_STARTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("medusa_workflow_runs_started_total", "Workflow runs started."),
        &["workflow_id"]
    )
    .unwrap();
    pub static ref WORKFLOW_RUNS_FINISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "medusa_workflow_runs_finished_total",
            "Workflow runs that reached done or reverted."
        ),
        &["workflow_id", "status"]
    )
    .unwrap();
    pub static ref WORKFLOW_STEPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("medusa_workflow_steps_total", "Step invocations by outcome."),
        &["workflow_id", "status"]
    )
    .unwrap();
    pub static ref WORKFLOW_STEP_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "medusa_workflow_step_duration_seconds",
            "Time spent in a step invoke, retries included."
        ),
        &["workflow_id"]
    )
    .unwrap();
    pub static ref WORKFLOW_COMPENSATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("medusa_workflow_compensations_total", "Compensations by outcome."),
        &["workflow_id", "status"]
    )
    .unwrap();
    pub static ref WORKFLOW_CHECKPOINT_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "medusa_workflow_checkpoint_failures_total",
        "Checkpoints the run store refused."
    )
    .unwrap();
}

static REGISTER: Once = Once::new();

/// Register every collector with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(WORKFLOW_RUNS_STARTED_TOTAL.clone()),
            Box::new(WORKFLOW_RUNS_FINISHED_TOTAL.clone()),
            Box::new(WORKFLOW_STEPS_TOTAL.clone()),
            Box::new(WORKFLOW_STEP_DURATION_SECONDS.clone()),
            Box::new(WORKFLOW_COMPENSATIONS_TOTAL.clone()),
            Box::new(WORKFLOW_CHECKPOINT_FAILURES_TOTAL.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!("Failed to register metric: {}", e);
            }
        }
    });
}

pub fn record_run_started(workflow_id: &str) {
    WORKFLOW_RUNS_STARTED_TOTAL.with_label_values(&[workflow_id]).inc();
}

pub fn record_run_finished(workflow_id: &str, status: &str) {
    WORKFLOW_RUNS_FINISHED_TOTAL
        .with_label_values(&[workflow_id, status])
        .inc();
}

pub fn record_step(workflow_id: &str, status: &str, elapsed: Duration) {
    WORKFLOW_STEPS_TOTAL.with_label_values(&[workflow_id, status]).inc();
    WORKFLOW_STEP_DURATION_SECONDS
        .with_label_values(&[workflow_id])
        .observe(elapsed.as_secs_f64());
}

pub fn record_compensation(workflow_id: &str, status: &str) {
    WORKFLOW_COMPENSATIONS_TOTAL
        .with_label_values(&[workflow_id, status])
        .inc();
}

pub fn record_checkpoint_failure() {
    WORKFLOW_CHECKPOINT_FAILURES_TOTAL.inc();
}

// Function to gather metrics for exposition
pub fn gather_metrics() -> Result<String> {
    register_metrics();
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
}
