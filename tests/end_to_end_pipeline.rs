// End-to-end pipeline runs against the public API
//
// Three stages: a single-shot outline, a fan-out render over four shots with
// at most two in flight, and a single-shot compose that reads both earlier outputs.

use async_trait::async_trait;
use reelflow::pipeline::{
    Agent, AgentRegistry, InMemoryTaskStore, Orchestrator, Pipeline, ProgressKind, RecordingSink,
    RetryPolicy, RunOutcome, StageDescriptor, StageError, TaskContext, TaskStatus,
};
use serde_json::{json, Value};
use std::sync::Arc;

struct OutlineAgent;

#[async_trait]
impl Agent for OutlineAgent {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, StageError> {
        let topic = ctx.input()["topic"].as_str().unwrap_or("untitled").to_string();
        Ok(json!({ "title": topic, "shots": 4 }))
    }
}

struct RenderAgent;

#[async_trait]
impl Agent for RenderAgent {
    async fn execute(&self, _ctx: &TaskContext) -> Result<Value, StageError> {
        Err(StageError::permanent("render only runs as a fan-out"))
    }

    async fn plan_sub_units(&self, ctx: &TaskContext) -> Result<Vec<Value>, StageError> {
        let shots = ctx
            .output("outline")
            .and_then(|outline| outline["shots"].as_u64())
            .ok_or_else(|| StageError::permanent("outline missing"))?;
        Ok((0..shots).map(|shot| json!({ "shot": shot })).collect())
    }

    async fn execute_sub_unit(&self, payload: Value) -> Result<Value, StageError> {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        Ok(json!({ "frame": format!("shot-{}.png", payload["shot"]) }))
    }
}

struct ComposeAgent;

#[async_trait]
impl Agent for ComposeAgent {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, StageError> {
        let title = ctx.output("outline").map(|o| o["title"].clone());
        let frames = ctx
            .output("render")
            .and_then(|r| r["items"].as_array())
            .map(|items| items.len())
            .unwrap_or(0);
        Ok(json!({ "title": title, "frames": frames }))
    }
}

fn build(sink: Arc<RecordingSink>) -> Orchestrator {
    let pipeline = Pipeline::new(vec![
        StageDescriptor::single("outline"),
        StageDescriptor::fan_out("render", 2),
        StageDescriptor::single("compose"),
    ])
    .unwrap();
    let registry = AgentRegistry::builder()
        .register("outline", Arc::new(OutlineAgent))
        .register("render", Arc::new(RenderAgent))
        .register("compose", Arc::new(ComposeAgent))
        .build();

    Orchestrator::builder(pipeline, registry, Arc::new(InMemoryTaskStore::new()))
        .with_sink(sink)
        .with_retry_policy(RetryPolicy::immediate())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_three_stage_pipeline_completes() {
    let sink = Arc::new(RecordingSink::new());
    let orchestrator = build(sink.clone());

    let task_id = orchestrator.submit(json!({ "topic": "tide pools" })).await.unwrap();
    let outcome = orchestrator.run(&task_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let report = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert!((report.progress - 1.0).abs() < 1e-9);
    assert_eq!(report.retry_count, 0);
    assert!(report.last_error.is_none());

    let task = orchestrator.store().load(&task_id).await.unwrap();
    assert_eq!(task.stage_results.len(), 3);
    assert_eq!(task.stage_results["compose"]["frames"], 4);
    assert_eq!(task.stage_results["compose"]["title"], "tide pools");
    assert_eq!(task.stage_results["render"]["succeeded"], 4);
}

#[tokio::test]
async fn test_events_arrive_in_pipeline_order() {
    let sink = Arc::new(RecordingSink::new());
    let orchestrator = build(sink.clone());

    let task_id = orchestrator.submit(json!({ "topic": "glaciers" })).await.unwrap();
    orchestrator.run(&task_id).await.unwrap();

    let milestones: Vec<String> = sink
        .events_for(&task_id)
        .into_iter()
        .filter_map(|event| match event.kind {
            ProgressKind::StageCompleted { stage, .. } => Some(stage),
            ProgressKind::TaskCompleted => Some("task-completed".to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(milestones, vec!["outline", "render", "compose", "task-completed"]);

    let progress: Vec<f64> = sink
        .events_for(&task_id)
        .into_iter()
        .filter_map(|event| match event.kind {
            ProgressKind::Progress { progress, .. } => Some(progress),
            ProgressKind::StageCompleted { progress, .. } => Some(progress),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));

    let progress_by_stage: Vec<(String, usize)> = sink
        .events_for(&task_id)
        .into_iter()
        .filter_map(|event| match event.kind {
            ProgressKind::Progress {
                stage, completed, ..
            } => Some((stage, completed)),
            _ => None,
        })
        .collect();
    // One event per settled render shot, one per single-unit stage.
    assert_eq!(progress_by_stage.len(), 6);
    assert_eq!(progress_by_stage.first(), Some(&("outline".to_string(), 1)));
    assert_eq!(progress_by_stage.last(), Some(&("compose".to_string(), 1)));
    assert_eq!(
        progress_by_stage
            .iter()
            .filter(|(stage, _)| stage == "render")
            .count(),
        4
    );
}

#[tokio::test]
async fn test_completed_task_is_not_rerun() {
    let sink = Arc::new(RecordingSink::new());
    let orchestrator = build(sink.clone());

    let task_id = orchestrator.submit(json!({ "topic": "dunes" })).await.unwrap();
    orchestrator.run(&task_id).await.unwrap();
    let before = sink.events_for(&task_id).len();

    let outcome = orchestrator.run(&task_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::AlreadyFinished(TaskStatus::Completed));
    assert_eq!(sink.events_for(&task_id).len(), before);
}
