use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use medusa_workflows::{
    container::Container,
    store::{MemoryRunStore, RunStore, RunSummary},
    workflow::{
        create_step, create_workflow, Data, ErrorKind, RunOptions, RunStatus, StepAction, StepConfig,
        StepExecutor, StepDefinition, StepResponse, StepStatus, WorkflowEngine, WorkflowRun,
    },
    Error, Result,
};
use serde_json::{json, Value};

/// Ordered log of invoke/compensate calls shared by the steps of a test.
#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    fn compensations(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with("compensate:"))
            .collect()
    }
}

fn engine() -> WorkflowEngine {
    engine_with_store(Arc::new(MemoryRunStore::new()))
}

fn engine_with_store(store: Arc<dyn RunStore>) -> WorkflowEngine {
    WorkflowEngine::new(store, Arc::new(StepExecutor::default()), Arc::new(Container::new()))
}

fn tracked_step(id: &'static str, journal: &Journal) -> StepDefinition {
    let invoke_journal = journal.clone();
    let compensate_journal = journal.clone();
    create_step(id, move |input, _ctx| {
        let journal = invoke_journal.clone();
        async move {
            journal.push(format!("invoke:{}", id));
            Ok(StepResponse::new(json!({ "step": id, "input": input })))
        }
    })
    .compensate(move |_input, _ctx| {
        let journal = compensate_journal.clone();
        async move {
            journal.push(format!("compensate:{}", id));
            Ok(())
        }
    })
}

fn failing_step(id: &'static str, journal: &Journal) -> StepDefinition {
    let journal = journal.clone();
    create_step(id, move |_input, _ctx| {
        let journal = journal.clone();
        async move {
            journal.push(format!("invoke:{}", id));
            Err(Error::StepExecution {
                step_id: id.to_string(),
                message: format!("{} is unavailable", id),
            })
        }
    })
}

fn no_throw(input: Value) -> RunOptions {
    RunOptions::new(input).throw_on_error(false)
}

#[tokio::test]
async fn test_independent_steps_run_concurrently() {
    let windows: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::default();
    let sleeper = |id: &'static str| {
        let windows = windows.clone();
        create_step(id, move |_input, _ctx| {
            let windows = windows.clone();
            async move {
                let started = Instant::now();
                tokio::time::sleep(Duration::from_millis(100)).await;
                windows.lock().unwrap().push((started, Instant::now()));
                Ok(StepResponse::new(json!(id)))
            }
        })
    };

    let definition = create_workflow("fan-out", |b, input| {
        let a = b.invoke(&sleeper("a"), input.clone())?;
        let b_out = b.invoke(&sleeper("b"), input.clone())?;
        let c = b.invoke(&sleeper("c"), input)?;
        Ok(Data::array([a, b_out, c]))
    })
    .expect("workflow should build");

    let engine = engine();
    engine.register(definition).await.unwrap();
    let result = engine.run("fan-out", RunOptions::new(json!({}))).await.unwrap();

    assert_eq!(result.status, RunStatus::Done);
    assert_eq!(result.result, Some(json!(["a", "b", "c"])));

    // Every step started before any of them finished
    let windows = windows.lock().unwrap().clone();
    assert_eq!(windows.len(), 3);
    let last_start = windows.iter().map(|(s, _)| *s).max().unwrap();
    let first_end = windows.iter().map(|(_, e)| *e).min().unwrap();
    assert!(last_start < first_end);
}

#[tokio::test]
async fn test_data_dependencies_order_execution() {
    let journal = Journal::default();
    let definition = create_workflow("chain", |b, input| {
        let a = b.invoke(&tracked_step("a", &journal), input)?;
        b.invoke(&tracked_step("b", &journal), a.get("step"))
    })
    .unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();
    let result = engine.run("chain", RunOptions::new(json!({"x": 1}))).await.unwrap();
    assert_eq!(result.result, Some(json!({"step": "b", "input": "a"})));

    let run = engine.get_run(&result.run_id).await.unwrap().expect("run is stored");
    let a = run.step("a").unwrap();
    let b = run.step("b").unwrap();
    assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
    assert_eq!(run.completion_order, vec!["a", "b"]);
    assert_eq!(journal.entries(), vec!["invoke:a", "invoke:b"]);
}

#[tokio::test]
async fn test_failure_compensates_in_reverse_completion_order() {
    let journal = Journal::default();
    let definition = create_workflow("unwind", |b, input| {
        let a = b.invoke(&tracked_step("a", &journal), input)?;
        let b_out = b.invoke(&tracked_step("b", &journal), a)?;
        let c = b.invoke(&tracked_step("c", &journal), b_out)?;
        b.invoke(&failing_step("d", &journal), c)
    })
    .unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();
    let result = engine.run("unwind", no_throw(json!({}))).await.unwrap();

    assert_eq!(result.status, RunStatus::Reverted);
    assert_eq!(
        journal.compensations(),
        vec!["compensate:c", "compensate:b", "compensate:a"]
    );
    for id in ["a", "b", "c"] {
        assert_eq!(journal.count(&format!("compensate:{}", id)), 1);
    }
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].step_id, "d");
    assert_eq!(result.errors[0].kind, ErrorKind::StepExecution);

    let run = engine.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(run.step("a").unwrap().status, StepStatus::Compensated);
    assert_eq!(run.step("d").unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn test_reserve_charge_create_order_scenario() {
    let journal = Journal::default();
    let definition = create_workflow("place-order", |b, input| {
        let reservation = b.invoke(&tracked_step("reserve-inventory", &journal), input.get("items"))?;
        let payment = b.invoke(&failing_step("charge-payment", &journal), reservation.clone())?;
        b.invoke(
            &tracked_step("create-order", &journal),
            Data::object([("reservation", reservation), ("payment", payment)]),
        )
    })
    .unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();
    let err = engine
        .run("place-order", RunOptions::new(json!({"items": ["sku_1"]})))
        .await
        .unwrap_err();

    match err {
        Error::RunFailed(failure) => {
            assert_eq!(failure.first.step_id, "charge-payment");
            let run = engine.get_run(&failure.run_id).await.unwrap().unwrap();
            assert_eq!(run.status, RunStatus::Reverted);
            assert_eq!(run.step("create-order").unwrap().status, StepStatus::Pending);
        }
        other => panic!("expected a run failure, got {:?}", other),
    }
    assert_eq!(journal.count("invoke:create-order"), 0);
    assert_eq!(journal.count("compensate:reserve-inventory"), 1);
}

#[tokio::test]
async fn test_compensation_failures_are_reported_with_the_cause() {
    let journal = Journal::default();
    let broken_cleanup = create_step("hold-stock", |_input, _ctx| async { Ok(StepResponse::empty()) })
        .compensate(|_input, _ctx| async {
            Err(Error::Internal("stock service is down".to_string()))
        });
    let definition = create_workflow("cleanup-fails", |b, input| {
        let first = b.invoke(&tracked_step("first", &journal), input)?;
        let held = b.invoke(&broken_cleanup, first)?;
        b.invoke(&failing_step("last", &journal), held)
    })
    .unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();
    let err = engine
        .run("cleanup-fails", RunOptions::new(json!({})))
        .await
        .unwrap_err();

    let Error::RunFailed(failure) = err else {
        panic!("expected a run failure");
    };
    assert_eq!(failure.first.step_id, "last");
    assert_eq!(failure.errors.len(), 2);
    assert_eq!(failure.errors[1].action, StepAction::Compensate);
    assert_eq!(failure.errors[1].kind, ErrorKind::Compensation);
    // The unwind continued past the failed compensation
    assert_eq!(journal.count("compensate:first"), 1);

    let run = engine.get_run(&failure.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Reverted);
    assert_eq!(run.step("hold-stock").unwrap().status, StepStatus::CompensationFailed);
}

#[tokio::test]
async fn test_retries_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let flaky = create_step("flaky", move |_input, _ctx| {
        let calls = counter.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Internal("try again".to_string()))
            } else {
                Ok(StepResponse::new(json!("ok")))
            }
        }
    })
    .with_config(
        StepConfig::default()
            .max_retries(2)
            .retry_interval(Duration::from_millis(5)),
    );
    let definition = create_workflow("retrying", |b, input| b.invoke(&flaky, input)).unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();
    let result = engine.run("retrying", RunOptions::new(json!({}))).await.unwrap();

    assert_eq!(result.status, RunStatus::Done);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let run = engine.get_run(&result.run_id).await.unwrap().unwrap();
    assert_eq!(run.step("flaky").unwrap().attempts, 3);
}

#[tokio::test]
async fn test_timeout_fails_the_step_and_reverts() {
    let journal = Journal::default();
    let slow = create_step("slow", |_input, _ctx| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(StepResponse::empty())
    });
    let definition = create_workflow("too-slow", |b, input| {
        let before = b.invoke(&tracked_step("before", &journal), input)?;
        b.invoke_with(&slow, before, StepConfig::default().timeout(Duration::from_millis(20)))
    })
    .unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();
    let result = engine.run("too-slow", no_throw(json!({}))).await.unwrap();

    assert_eq!(result.status, RunStatus::Reverted);
    assert_eq!(result.errors[0].kind, ErrorKind::StepTimeout);
    assert_eq!(journal.count("compensate:before"), 1);
}

#[tokio::test]
async fn test_false_condition_skips_guarded_steps() {
    let journal = Journal::default();
    let definition = create_workflow("maybe-notify", |b, input| {
        let created = b.invoke(&tracked_step("create", &journal), input.clone())?;
        let notified = b.when(
            "has-email",
            input.get("email"),
            |email| email.is_string(),
            |b| b.invoke(&tracked_step("notify", &journal), input.get("email")),
        )?;
        Ok(Data::object([("created", created), ("notified", notified)]))
    })
    .unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();

    let skipped = engine.run("maybe-notify", RunOptions::new(json!({}))).await.unwrap();
    assert_eq!(skipped.status, RunStatus::Done);
    assert_eq!(skipped.result.as_ref().unwrap()["notified"], Value::Null);
    let run = engine.get_run(&skipped.run_id).await.unwrap().unwrap();
    assert_eq!(run.step("notify").unwrap().status, StepStatus::Skipped);
    assert_eq!(journal.count("invoke:notify"), 0);

    let notified = engine
        .run("maybe-notify", RunOptions::new(json!({"email": "jane@example.com"})))
        .await
        .unwrap();
    assert_eq!(
        notified.result.unwrap()["notified"]["input"],
        json!("jane@example.com")
    );
    assert_eq!(journal.count("invoke:notify"), 1);
}

#[tokio::test]
async fn test_transform_failure_reverts_earlier_steps() {
    let journal = Journal::default();
    let definition = create_workflow("bad-transform", |b, input| {
        let first = b.invoke(&tracked_step("first", &journal), input)?;
        let shaped = b.transform("shape", first, |_| Err(Error::Validation("bad shape".to_string())))?;
        b.invoke(&tracked_step("second", &journal), shaped)
    })
    .unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();
    let result = engine.run("bad-transform", no_throw(json!({}))).await.unwrap();

    assert_eq!(result.status, RunStatus::Reverted);
    assert_eq!(result.errors[0].step_id, "shape");
    assert_eq!(result.errors[0].kind, ErrorKind::Validation);
    assert_eq!(journal.count("invoke:second"), 0);
    assert_eq!(journal.count("compensate:first"), 1);
}

#[tokio::test]
async fn test_transaction_id_makes_runs_idempotent() {
    let journal = Journal::default();
    let definition =
        create_workflow("once", |b, input| b.invoke(&tracked_step("only", &journal), input)).unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();
    let first = engine
        .run("once", RunOptions::new(json!({"n": 1})).transaction_id("tx_1"))
        .await
        .unwrap();
    let second = engine
        .run("once", RunOptions::new(json!({"n": 2})).transaction_id("tx_1"))
        .await
        .unwrap();

    assert_eq!(first.run_id, "tx_1");
    assert_eq!(first, second);
    assert_eq!(journal.count("invoke:only"), 1);
}

#[tokio::test]
async fn test_concurrent_runs_keep_separate_contexts() {
    let echo = create_step("echo", |input: Value, ctx| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(StepResponse::new(json!({ "run_id": ctx.metadata.run_id, "input": input })))
    });
    let definition = create_workflow("echo", |b, input| {
        let first = b.invoke(&echo, input.get("value"))?;
        b.transform("wrap", first, Ok)
    })
    .unwrap();

    let engine = engine();
    engine.register(definition).await.unwrap();

    let (left, right) = tokio::join!(
        engine.run("echo", RunOptions::new(json!({"value": "left"}))),
        engine.run("echo", RunOptions::new(json!({"value": "right"}))),
    );
    let left = left.unwrap();
    let right = right.unwrap();

    assert_ne!(left.run_id, right.run_id);
    assert_eq!(left.result.as_ref().unwrap()["input"], json!("left"));
    assert_eq!(right.result.as_ref().unwrap()["input"], json!("right"));
    assert_eq!(left.result.unwrap()["run_id"], json!(left.run_id));
    assert_eq!(right.result.unwrap()["run_id"], json!(right.run_id));
}

#[tokio::test]
async fn test_unknown_workflow_is_rejected() {
    let err = engine().run("ghost", RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::UnknownWorkflow(id) if id == "ghost"));
}

#[tokio::test]
async fn test_input_validator_rejects_before_a_run_exists() {
    let journal = Journal::default();
    let definition = create_workflow("validated", |b, input| b.invoke(&tracked_step("s", &journal), input))
        .unwrap()
        .with_input_validator(|input| {
            if input.get("id").map_or(false, Value::is_string) {
                Ok(())
            } else {
                Err(Error::Validation("id is required".to_string()))
            }
        });

    let store = Arc::new(MemoryRunStore::new());
    let engine = engine_with_store(store.clone());
    engine.register(definition).await.unwrap();
    let err = engine.run("validated", RunOptions::new(json!({}))).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(store.list(None, 10).await.unwrap().is_empty());
}

fn async_workflow(journal: &Journal) -> medusa_workflows::workflow::WorkflowDefinition {
    let journal = journal.clone();
    create_workflow("await-payment", move |b, input| {
        let reserved = b.invoke(&tracked_step("reserve", &journal), input)?;
        let payment = b.invoke_with(
            &tracked_step("authorize-payment", &journal),
            reserved,
            StepConfig::default().async_step(),
        )?;
        b.invoke(&tracked_step("complete", &journal), payment.get("status"))
    })
    .unwrap()
}

#[tokio::test]
async fn test_async_step_resumes_on_a_fresh_engine() {
    let journal = Journal::default();
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());

    let first_engine = engine_with_store(store.clone());
    first_engine.register(async_workflow(&journal)).await.unwrap();
    let suspended = first_engine
        .run("await-payment", RunOptions::new(json!({"cart": "cart_1"})))
        .await
        .unwrap();
    assert!(suspended.is_suspended());
    assert_eq!(journal.count("invoke:complete"), 0);

    let run = store.load(&suspended.run_id).await.unwrap().unwrap();
    assert_eq!(run.waiting_steps(), vec!["authorize-payment"]);
    drop(first_engine);

    // A new process picks the run up from the store
    let second_engine = engine_with_store(store.clone());
    second_engine.register(async_workflow(&journal)).await.unwrap();
    let finished = second_engine
        .set_step_success(&suspended.run_id, "authorize-payment", json!({"status": "authorized"}))
        .await
        .unwrap();

    assert_eq!(finished.status, RunStatus::Done);
    assert_eq!(
        finished.result,
        Some(json!({"step": "complete", "input": "authorized"}))
    );

    let err = second_engine
        .set_step_success(&suspended.run_id, "authorize-payment", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition(_)));
}

#[tokio::test]
async fn test_async_step_failure_reverts_the_run() {
    let journal = Journal::default();
    let engine = engine();
    engine.register(async_workflow(&journal)).await.unwrap();
    let suspended = engine
        .run("await-payment", RunOptions::new(json!({})))
        .await
        .unwrap();

    let reverted = engine
        .set_step_failure(&suspended.run_id, "authorize-payment", "card declined")
        .await
        .unwrap();
    assert_eq!(reverted.status, RunStatus::Reverted);
    assert!(reverted.errors[0].message.contains("card declined"));
    assert_eq!(journal.compensations(), vec!["compensate:reserve"]);
    assert_eq!(journal.count("invoke:complete"), 0);
}

fn key_recording_step(id: &'static str, journal: &Journal) -> StepDefinition {
    let journal = journal.clone();
    create_step(id, move |input, ctx| {
        let journal = journal.clone();
        async move {
            let key = ctx.metadata.idempotency_key.as_deref().unwrap_or("none");
            journal.push(format!("{}:{}", id, key));
            Ok(StepResponse::new(input))
        }
    })
}

#[tokio::test]
async fn test_idempotency_key_survives_a_signal() {
    let journal = Journal::default();
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let keyed_workflow = |journal: &Journal| {
        let journal = journal.clone();
        create_workflow("keyed", move |b, input| {
            let first = b.invoke(&key_recording_step("first", &journal), input)?;
            let wait = b.invoke_with(
                &key_recording_step("wait", &journal),
                first,
                StepConfig::default().async_step(),
            )?;
            b.invoke(&key_recording_step("after", &journal), wait)
        })
        .unwrap()
    };

    let engine = engine_with_store(store.clone());
    engine.register(keyed_workflow(&journal)).await.unwrap();
    let suspended = engine
        .run("keyed", RunOptions::new(json!({})).transaction_id("tx_1"))
        .await
        .unwrap();
    assert!(suspended.is_suspended());
    let stored = store.load("tx_1").await.unwrap().unwrap();
    assert_eq!(stored.idempotency_key.as_deref(), Some("tx_1"));

    let fresh = engine_with_store(store.clone());
    fresh.register(keyed_workflow(&journal)).await.unwrap();
    let finished = fresh.set_step_success("tx_1", "wait", Value::Null).await.unwrap();

    assert_eq!(finished.status, RunStatus::Done);
    assert_eq!(
        journal.entries(),
        vec!["first:tx_1", "wait:tx_1", "after:tx_1"]
    );
}

#[tokio::test]
async fn test_signal_for_unknown_run_is_not_found() {
    let err = engine()
        .set_step_success("missing", "step", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

/// Memory store that refuses every save after the first `allowed` ones.
struct FlakyStore {
    inner: MemoryRunStore,
    allowed: usize,
    saves: AtomicUsize,
}

#[async_trait]
impl RunStore for FlakyStore {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn save(&self, run: &WorkflowRun) -> Result<()> {
        if self.saves.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(Error::Internal("disk full".to_string()));
        }
        self.inner.save(run).await
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        self.inner.load(run_id).await
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        self.inner.delete(run_id).await
    }

    async fn list(&self, workflow_id: Option<&str>, limit: i64) -> Result<Vec<RunSummary>> {
        self.inner.list(workflow_id, limit).await
    }
}

/// Store whose writes take a while, like a remote database under load.
struct SlowStore {
    inner: MemoryRunStore,
    delay: Duration,
}

#[async_trait]
impl RunStore for SlowStore {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn save(&self, run: &WorkflowRun) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.save(run).await
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        self.inner.load(run_id).await
    }

    async fn delete(&self, run_id: &str) -> Result<()> {
        self.inner.delete(run_id).await
    }

    async fn list(&self, workflow_id: Option<&str>, limit: i64) -> Result<Vec<RunSummary>> {
        self.inner.list(workflow_id, limit).await
    }
}

#[tokio::test]
async fn test_steps_progress_while_a_checkpoint_is_written() {
    let quick = create_step("quick", |_input, _ctx| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(StepResponse::empty())
    });
    let ticker = create_step("ticker", |_input, _ctx| async {
        let started = Instant::now();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(StepResponse::new(json!(started.elapsed().as_millis() as u64)))
    });
    let definition = create_workflow("slow-store", |b, input| {
        b.invoke(&quick, input.clone())?;
        b.invoke(&ticker, input)
    })
    .unwrap();

    let engine = engine_with_store(Arc::new(SlowStore {
        inner: MemoryRunStore::new(),
        delay: Duration::from_millis(100),
    }));
    engine.register(definition).await.unwrap();
    let result = engine.run("slow-store", RunOptions::new(json!({}))).await.unwrap();

    assert_eq!(result.status, RunStatus::Done);
    let ticked_ms = result.result.and_then(|v| v.as_u64()).unwrap();
    assert!(ticked_ms < 80, "ticker stalled for {}ms", ticked_ms);
}

#[tokio::test]
async fn test_checkpoint_failure_is_returned_to_the_caller() {
    let journal = Journal::default();
    let definition = create_workflow("fragile", |b, input| {
        let a = b.invoke(&tracked_step("a", &journal), input)?;
        b.invoke(&tracked_step("b", &journal), a)
    })
    .unwrap();

    // pending, running, and "a" started; the completion of "a" is refused
    let store = Arc::new(FlakyStore {
        inner: MemoryRunStore::new(),
        allowed: 3,
        saves: AtomicUsize::new(0),
    });
    let engine = engine_with_store(store);
    engine.register(definition).await.unwrap();

    let err = engine
        .run("fragile", RunOptions::new(json!({})).throw_on_error(false))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(msg) if msg == "disk full"));
    assert_eq!(journal.count("invoke:b"), 0);
}

#[tokio::test]
async fn test_resume_fails_interrupted_steps_and_reverts() {
    let journal = Journal::default();
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let definition = || {
        create_workflow("interrupted", |b, input| {
            let a = b.invoke(&tracked_step("a", &journal), input)?;
            b.invoke(&tracked_step("b", &journal), a)
        })
        .unwrap()
    };

    // Simulate a process that died while "b" was running
    let mut run = WorkflowRun::new(
        "run_crashed".to_string(),
        "interrupted".to_string(),
        json!({}),
        ["a", "b"],
    );
    run.transition(RunStatus::Running).unwrap();
    run.steps.get_mut("a").unwrap().status = StepStatus::Success;
    run.steps.get_mut("a").unwrap().output = Some(json!({"step": "a"}));
    run.completion_order.push("a".to_string());
    run.steps.get_mut("b").unwrap().status = StepStatus::Running;
    run.checkpoint = 7;
    store.save(&run).await.unwrap();

    let engine = engine_with_store(store.clone());
    engine.register(definition()).await.unwrap();
    let result = engine.resume("run_crashed").await.unwrap();

    assert_eq!(result.status, RunStatus::Reverted);
    assert_eq!(result.errors[0].step_id, "b");
    assert_eq!(journal.compensations(), vec!["compensate:a"]);
    assert!(store.load("run_crashed").await.unwrap().unwrap().checkpoint > 7);
}
