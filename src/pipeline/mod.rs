// Multi-stage task pipeline
//
// A task moves through an ordered list of stages, each handled by one agent.
// Fan-out stages split into sub-units that run under a concurrency bound.

pub mod driver;
pub mod error;
pub mod limiter;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod types;

pub use driver::TaskDriver;
pub use error::{ErrorKind, FailureKind, OrchestratorError, StageError, TransitionError};
pub use limiter::{aggregate, ConcurrencyLimiter, FanOutSummary};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, RunOutcome, TaskReport, DEFAULT_MAX_RETRIES,
};
pub use progress::{
    ChannelSink, FanoutSink, ProgressEvent, ProgressKind, ProgressSink, RecordingSink,
    TracingSink,
};
pub use registry::{Agent, AgentRegistry, AgentRegistryBuilder};
pub use retry::{RetryDecision, RetryPolicy};
pub use state_machine::{TaskEvent, TaskStateMachine};
pub use store::{InMemoryTaskStore, JsonFileTaskStore, StoreError, TaskStore};
pub use types::{
    FailureTolerance, Pipeline, StageDescriptor, StageMode, SubUnitInput, SubUnitOutcome,
    SubUnitResult, Task, TaskContext, TaskError, TaskId, TaskPatch, TaskStatus,
};

#[cfg(any(test, feature = "testing"))]
pub use registry::MockAgent;
