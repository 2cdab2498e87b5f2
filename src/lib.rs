// Reelflow Library - staged task pipeline orchestration
// This exposes the core components for testing and integration

pub mod agents;
pub mod config;
pub mod database;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use agents::{simulated_registry, SimulatedAgent};
pub use config::{ConfigError, ReelflowConfig};
pub use notify::{NotifyError, WebhookNotifier};
pub use observability::{pipeline_metrics, OperationTimer, PipelineMetrics};
pub use pipeline::{
    Agent, AgentRegistry, Orchestrator, OrchestratorError, Pipeline, ProgressEvent, ProgressSink,
    RetryPolicy, RunOutcome, StageDescriptor, StageError, TaskDriver, TaskId, TaskStateMachine,
    TaskStatus, TaskStore,
};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{
    create_task_span, generate_correlation_id, init_telemetry, shutdown_telemetry,
};

#[cfg(feature = "database")]
pub use database::SqliteTaskStore;
