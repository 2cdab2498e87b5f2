// Cancellation against in-flight and scheduled work

use async_trait::async_trait;
use reelflow::pipeline::{
    Agent, AgentRegistry, InMemoryTaskStore, Orchestrator, Pipeline, ProgressKind, RecordingSink,
    RetryPolicy, RunOutcome, StageDescriptor, StageError, TaskContext, TaskDriver, TaskId,
    TaskPatch, TaskStatus, TaskStore,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct AlwaysTransient {
    calls: AtomicU32,
}

#[async_trait]
impl Agent for AlwaysTransient {
    async fn execute(&self, _ctx: &TaskContext) -> Result<Value, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StageError::transient("upstream 503"))
    }
}

/// Signals once it starts, then blocks until the run is cancelled.
struct BlockingAgent {
    started: Arc<Notify>,
}

#[async_trait]
impl Agent for BlockingAgent {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, StageError> {
        self.started.notify_one();
        ctx.cancellation().cancelled().await;
        Ok(json!({ "late": true }))
    }
}

/// Cancels through the shared store, as another process would, without touching
/// any in-process token.
async fn cancel_in_store(store: &InMemoryTaskStore, task_id: &TaskId, from: TaskStatus) {
    let swapped = store
        .compare_and_swap_status(task_id, &from, TaskStatus::Cancelled, TaskPatch::new())
        .await
        .unwrap();
    assert!(swapped, "task was not in {from}");
}

/// Cancels its own task in the store mid-stage, then returns a result anyway.
struct CancelledElsewhere {
    store: Arc<InMemoryTaskStore>,
}

#[async_trait]
impl Agent for CancelledElsewhere {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, StageError> {
        cancel_in_store(&self.store, &ctx.task_id, TaskStatus::running(0)).await;
        Ok(json!({ "late": true }))
    }
}

/// A long fan-out whose first shot cancels the task in the store.
struct LongFanOut {
    store: Arc<InMemoryTaskStore>,
    executed: AtomicU32,
}

#[async_trait]
impl Agent for LongFanOut {
    async fn execute(&self, _ctx: &TaskContext) -> Result<Value, StageError> {
        Ok(json!({}))
    }

    async fn plan_sub_units(&self, ctx: &TaskContext) -> Result<Vec<Value>, StageError> {
        Ok((0..100)
            .map(|shot| json!({ "task": ctx.task_id.as_str(), "shot": shot }))
            .collect())
    }

    async fn execute_sub_unit(&self, payload: Value) -> Result<Value, StageError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        if payload["shot"] == 0 {
            let task_id = TaskId::from(payload["task"].as_str().unwrap_or_default());
            cancel_in_store(&self.store, &task_id, TaskStatus::running(0)).await;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(payload)
    }
}

fn orchestrator(
    agent: Arc<dyn Agent>,
    retry: RetryPolicy,
    sink: Arc<RecordingSink>,
) -> Orchestrator {
    let pipeline = Pipeline::new(vec![
        StageDescriptor::single("draft"),
        StageDescriptor::single("publish"),
    ])
    .unwrap();
    let registry = AgentRegistry::builder()
        .register("draft", agent.clone())
        .register("publish", agent)
        .build();
    Orchestrator::builder(pipeline, registry, Arc::new(InMemoryTaskStore::new()))
        .with_sink(sink)
        .with_retry_policy(retry)
        .with_max_retries(5)
        .build()
        .unwrap()
}

fn no_stage_started_after_cancel(sink: &RecordingSink, task_id: &TaskId) -> bool {
    sink.events_for(task_id)
        .iter()
        .skip_while(|event| !matches!(event.kind, ProgressKind::TaskCancelled))
        .all(|event| !matches!(event.kind, ProgressKind::StageStarted { .. }))
}

#[tokio::test]
async fn test_cancel_while_retrying_is_final() {
    let sink = Arc::new(RecordingSink::new());
    let agent = Arc::new(AlwaysTransient {
        calls: AtomicU32::new(0),
    });
    let orchestrator = orchestrator(
        agent.clone(),
        RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(60), false),
        sink.clone(),
    );

    let task_id = orchestrator.submit(json!({})).await.unwrap();
    let outcome = orchestrator.run(&task_id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::RetryScheduled { .. }));
    assert_eq!(
        orchestrator.status(&task_id).await.unwrap().status,
        TaskStatus::Retrying
    );

    assert!(orchestrator.cancel(&task_id).await.unwrap());
    assert_eq!(
        orchestrator.status(&task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );

    // A worker picking the task up later must not resurrect it.
    let later = orchestrator.run(&task_id).await.unwrap();
    assert_eq!(later, RunOutcome::AlreadyFinished(TaskStatus::Cancelled));
    assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    assert!(!orchestrator.cancel(&task_id).await.unwrap());
    assert!(no_stage_started_after_cancel(&sink, &task_id));
}

#[tokio::test]
async fn test_cancel_during_stage_discards_result() {
    let sink = Arc::new(RecordingSink::new());
    let started = Arc::new(Notify::new());
    let orchestrator = Arc::new(orchestrator(
        Arc::new(BlockingAgent {
            started: started.clone(),
        }),
        RetryPolicy::immediate(),
        sink.clone(),
    ));

    let task_id = orchestrator.submit(json!({})).await.unwrap();
    let run = {
        let orchestrator = orchestrator.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move { orchestrator.run(&task_id).await })
    };

    started.notified().await;
    assert!(orchestrator.cancel(&task_id).await.unwrap());

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run should observe the cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);

    let task = orchestrator.store().load(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.stage_results.is_empty());
    assert_eq!(orchestrator.active_runs(), 0);
    assert!(no_stage_started_after_cancel(&sink, &task_id));
}

#[tokio::test]
async fn test_driver_stops_after_cancel_during_backoff() {
    let sink = Arc::new(RecordingSink::new());
    let agent = Arc::new(AlwaysTransient {
        calls: AtomicU32::new(0),
    });
    let orchestrator = Arc::new(orchestrator(
        agent.clone(),
        RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(100), false),
        sink.clone(),
    ));
    let driver = TaskDriver::new(orchestrator.clone());

    let task_id = orchestrator.submit(json!({})).await.unwrap();
    let handle = driver.spawn(task_id.clone()).unwrap();

    // Wait for the first failure to be recorded, then cancel inside the backoff window.
    for _ in 0..100 {
        if orchestrator.status(&task_id).await.unwrap().status == TaskStatus::Retrying {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(orchestrator.cancel(&task_id).await.unwrap());

    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Cancelled | RunOutcome::AlreadyFinished(TaskStatus::Cancelled)
    ));
    assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        orchestrator.status(&task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert!(no_stage_started_after_cancel(&sink, &task_id));
}

#[tokio::test]
async fn test_store_cancel_during_stage_discards_result() {
    let store = Arc::new(InMemoryTaskStore::new());
    let sink = Arc::new(RecordingSink::new());
    let agent = Arc::new(CancelledElsewhere {
        store: store.clone(),
    });
    let pipeline = Pipeline::new(vec![
        StageDescriptor::single("draft"),
        StageDescriptor::single("publish"),
    ])
    .unwrap();
    let registry = AgentRegistry::builder()
        .register("draft", agent.clone())
        .register("publish", agent)
        .build();
    let orchestrator = Orchestrator::builder(pipeline, registry, store.clone())
        .with_sink(sink.clone())
        .with_retry_policy(RetryPolicy::immediate())
        .build()
        .unwrap();

    let task_id = orchestrator.submit(json!({})).await.unwrap();
    assert_eq!(orchestrator.run(&task_id).await.unwrap(), RunOutcome::Cancelled);

    let task = store.load(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.stage_results.is_empty());
    assert!(!sink
        .events_for(&task_id)
        .iter()
        .any(|event| matches!(event.kind, ProgressKind::StageCompleted { .. })));
    assert_eq!(orchestrator.active_runs(), 0);
}

#[tokio::test]
async fn test_store_cancel_stops_fan_out_between_sub_units() {
    let store = Arc::new(InMemoryTaskStore::new());
    let agent = Arc::new(LongFanOut {
        store: store.clone(),
        executed: AtomicU32::new(0),
    });
    let pipeline = Pipeline::new(vec![StageDescriptor::fan_out("shots", 1)]).unwrap();
    let registry = AgentRegistry::builder()
        .register("shots", agent.clone())
        .build();
    let orchestrator = Orchestrator::builder(pipeline, registry, store.clone())
        .with_retry_policy(RetryPolicy::immediate())
        .build()
        .unwrap();

    let task_id = orchestrator.submit(json!({})).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), orchestrator.run(&task_id))
        .await
        .expect("run should stop once the stored status is cancelled")
        .unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);

    let executed = agent.executed.load(Ordering::SeqCst);
    assert!(executed < 10, "{executed} sub-units ran after the cancel");
    let task = store.load(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.stage_results.is_empty());
}
