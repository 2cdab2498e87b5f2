// Fan-out concurrency bound
//
// Tracks how many sub-units are inside the agent at once and checks the
// high-water mark against the stage's configured limit.

use async_trait::async_trait;
use reelflow::pipeline::{
    Agent, AgentRegistry, InMemoryTaskStore, Orchestrator, Pipeline, RetryPolicy, RunOutcome,
    StageDescriptor, StageError, TaskContext,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct GaugedAgent {
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
    executed: AtomicUsize,
}

#[async_trait]
impl Agent for GaugedAgent {
    async fn execute(&self, _ctx: &TaskContext) -> Result<Value, StageError> {
        Ok(json!({}))
    }

    async fn plan_sub_units(&self, _ctx: &TaskContext) -> Result<Vec<Value>, StageError> {
        Ok((0..12).map(|frame| json!({ "frame": frame })).collect())
    }

    async fn execute_sub_unit(&self, payload: Value) -> Result<Value, StageError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(payload)
    }
}

async fn run_with_limit(limit: usize) -> Arc<GaugedAgent> {
    let agent = Arc::new(GaugedAgent::default());
    let pipeline = Pipeline::new(vec![StageDescriptor::fan_out("frames", limit)]).unwrap();
    let registry = AgentRegistry::builder()
        .register("frames", agent.clone())
        .build();
    let orchestrator = Orchestrator::builder(pipeline, registry, Arc::new(InMemoryTaskStore::new()))
        .with_retry_policy(RetryPolicy::immediate())
        .build()
        .unwrap();

    let task_id = orchestrator.submit(json!({})).await.unwrap();
    assert_eq!(orchestrator.run(&task_id).await.unwrap(), RunOutcome::Completed);
    agent
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_high_water_mark_respects_limit() {
    for limit in [1, 3, 5] {
        let agent = run_with_limit(limit).await;
        assert_eq!(agent.executed.load(Ordering::SeqCst), 12);
        let high_water = agent.high_water.load(Ordering::SeqCst);
        assert!(
            high_water <= limit,
            "limit {limit} exceeded: {high_water} sub-units in flight"
        );
        assert!(high_water >= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limit_above_sub_unit_count() {
    let agent = run_with_limit(64).await;
    assert_eq!(agent.executed.load(Ordering::SeqCst), 12);
    assert!(agent.high_water.load(Ordering::SeqCst) <= 12);
}
