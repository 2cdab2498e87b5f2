use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::pipeline::{
    Agent, AgentRegistry, Pipeline, StageError, TaskContext,
};

/// Stand-in for a provider-backed agent: sleeps, then fails transiently with a
/// configured probability.
#[derive(Debug, Clone)]
pub struct SimulatedAgent {
    stage: String,
    failure_rate: f64,
    latency: Duration,
    sub_units: usize,
}

impl SimulatedAgent {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            failure_rate: 0.0,
            latency: Duration::from_millis(20),
            sub_units: 4,
        }
    }

    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sub-units planned when the stage fans out
    pub fn with_sub_units(mut self, sub_units: usize) -> Self {
        self.sub_units = sub_units;
        self
    }

    fn roll(&self, what: &str) -> Result<(), StageError> {
        if self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate) {
            debug!(stage = %self.stage, what, "Simulated provider failure");
            return Err(StageError::transient(format!(
                "{}: simulated provider timeout during {}",
                self.stage, what
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for SimulatedAgent {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, StageError> {
        ctx.cancellation()
            .run_until_cancelled(tokio::time::sleep(self.latency))
            .await;
        self.roll("execute")?;
        Ok(json!({
            "stage": self.stage,
            "attempt": ctx.attempt,
            "inputs": ctx.outputs().keys().collect::<Vec<_>>(),
        }))
    }

    async fn plan_sub_units(&self, ctx: &TaskContext) -> Result<Vec<Value>, StageError> {
        self.roll("planning")?;
        Ok((0..self.sub_units)
            .map(|shot| json!({ "stage": self.stage, "shot": shot, "task_id": ctx.task_id }))
            .collect())
    }

    async fn execute_sub_unit(&self, payload: Value) -> Result<Value, StageError> {
        tokio::time::sleep(self.latency).await;
        self.roll("sub-unit")?;
        let shot = payload.get("shot").cloned().unwrap_or(Value::Null);
        Ok(json!({
            "shot": shot,
            "asset": format!("{}/{}.bin", self.stage, shot),
        }))
    }
}

/// One simulated agent per pipeline stage.
pub fn simulated_registry(
    pipeline: &Pipeline,
    failure_rate: f64,
    latency: Duration,
    sub_units: usize,
) -> AgentRegistry {
    pipeline
        .stages()
        .iter()
        .fold(AgentRegistry::builder(), |builder, stage| {
            let agent = SimulatedAgent::new(&stage.name)
                .with_failure_rate(failure_rate)
                .with_latency(latency)
                .with_sub_units(sub_units);
            builder.register(stage.name.clone(), Arc::new(agent))
        })
        .build()
}
