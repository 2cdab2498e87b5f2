// Agent contract and stage-to-agent registry
//
// The registry is built once before the orchestrator is constructed and is
// read-only afterwards.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{OrchestratorError, StageError};
use super::types::{Pipeline, TaskContext};

/// Pluggable unit of work for one stage.
///
/// Single-unit stages only need `execute`. Fan-out stages implement
/// `plan_sub_units` and `execute_sub_unit` instead.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run the stage as a single unit.
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, StageError>;

    /// Split the stage into independent sub-unit payloads.
    async fn plan_sub_units(&self, ctx: &TaskContext) -> Result<Vec<Value>, StageError> {
        Err(StageError::permanent(format!(
            "agent for stage '{}' does not support fan-out",
            ctx.stage
        )))
    }

    /// Run one sub-unit produced by `plan_sub_units`.
    async fn execute_sub_unit(&self, payload: Value) -> Result<Value, StageError> {
        let _ = payload;
        Err(StageError::permanent("agent does not support fan-out"))
    }
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<&String> = self.agents.keys().collect();
        stages.sort();
        f.debug_struct("AgentRegistry").field("stages", &stages).finish()
    }
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::default()
    }

    pub fn resolve(&self, stage: &str) -> Result<Arc<dyn Agent>, OrchestratorError> {
        self.agents
            .get(stage)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownStage {
                stage: stage.to_string(),
            })
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.agents.contains_key(stage)
    }

    pub fn stages(&self) -> Vec<&str> {
        let mut stages: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        stages.sort_unstable();
        stages
    }

    /// Pipeline stages that have no agent registered.
    pub fn missing_stages(&self, pipeline: &Pipeline) -> Vec<String> {
        pipeline
            .stages()
            .iter()
            .filter(|stage| !self.contains(&stage.name))
            .map(|stage| stage.name.clone())
            .collect()
    }
}

#[derive(Default)]
pub struct AgentRegistryBuilder {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistryBuilder {
    pub fn register(mut self, stage: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        let stage = stage.into();
        if self.agents.insert(stage.clone(), agent).is_some() {
            warn!(stage = %stage, "Replacing previously registered agent");
        } else {
            info!(stage = %stage, "Registered agent");
        }
        self
    }

    pub fn build(self) -> AgentRegistry {
        AgentRegistry {
            agents: self.agents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{StageDescriptor, Task};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn execute(&self, ctx: &TaskContext) -> Result<Value, StageError> {
            Ok(json!({ "stage": ctx.stage, "input": ctx.input() }))
        }
    }

    #[test]
    fn test_resolve_unknown_stage() {
        let registry = AgentRegistry::builder()
            .register("style", Arc::new(EchoAgent))
            .build();

        assert!(registry.resolve("style").is_ok());
        assert!(matches!(
            registry.resolve("story"),
            Err(OrchestratorError::UnknownStage { stage }) if stage == "story"
        ));
    }

    #[test]
    fn test_missing_stages() {
        let pipeline = Pipeline::new(vec![
            StageDescriptor::single("style"),
            StageDescriptor::single("story"),
        ])
        .unwrap();
        let registry = AgentRegistry::builder()
            .register("style", Arc::new(EchoAgent))
            .build();

        assert_eq!(registry.missing_stages(&pipeline), vec!["story".to_string()]);
    }

    #[tokio::test]
    async fn test_default_fan_out_methods_are_permanent_errors() {
        let task = Task::new(json!({"topic": "space"}), 3);
        let ctx = TaskContext::new(&task, "style", CancellationToken::new());

        let err = EchoAgent.plan_sub_units(&ctx).await.unwrap_err();
        assert!(matches!(err, StageError::Permanent { .. }));

        let err = EchoAgent.execute_sub_unit(json!({})).await.unwrap_err();
        assert!(matches!(err, StageError::Permanent { .. }));
    }

    #[tokio::test]
    async fn test_mock_agent_through_registry() {
        let mut mock = MockAgent::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Ok(json!({"style": "noir"})));

        let registry = AgentRegistry::builder()
            .register("style", Arc::new(mock))
            .build();

        let task = Task::new(json!({}), 3);
        let ctx = TaskContext::new(&task, "style", CancellationToken::new());
        let agent = registry.resolve("style").unwrap();
        assert_eq!(agent.execute(&ctx).await.unwrap(), json!({"style": "noir"}));
    }
}
