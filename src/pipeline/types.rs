// Core types for the stage pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::{FailureKind, OrchestratorError, StageError};

/// Opaque task identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Task status. `Running` carries the 0-based ordinal of the active stage.
///
/// The persisted form is the display string (`pending`, `stage-1-running`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TaskStatus {
    Pending,
    Running { stage: usize },
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub fn running(stage: usize) -> Self {
        TaskStatus::Running { stage }
    }

    /// No outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn running_stage(&self) -> Option<usize> {
        match self {
            TaskStatus::Running { stage } => Some(*stage),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => f.write_str("pending"),
            TaskStatus::Running { stage } => write!(f, "stage-{}-running", stage + 1),
            TaskStatus::Completed => f.write_str("completed"),
            TaskStatus::Failed => f.write_str("failed"),
            TaskStatus::Cancelled => f.write_str("cancelled"),
            TaskStatus::Retrying => f.write_str("retrying"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "retrying" => Ok(TaskStatus::Retrying),
            other => other
                .strip_prefix("stage-")
                .and_then(|rest| rest.strip_suffix("-running"))
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .map(|n| TaskStatus::Running { stage: n - 1 })
                .ok_or_else(|| format!("unknown task status '{other}'")),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Error recorded on a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
    /// Name of the originating stage
    pub stage: String,
    pub at: DateTime<Utc>,
}

impl TaskError {
    pub fn from_stage_error(stage: &str, error: &StageError) -> Self {
        Self {
            kind: error.failure_kind(),
            message: error.to_string(),
            stage: stage.to_string(),
            at: Utc::now(),
        }
    }
}

/// Persisted task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Ordinal of the current stage; the resume point after a failure.
    pub stage: usize,
    pub progress: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<TaskError>,
    pub input: Value,
    /// Append-only map of stage name to result payload.
    #[serde(default)]
    pub stage_results: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a retrying task may be resumed.
    pub resume_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(input: Value, max_retries: u32) -> Self {
        Self::with_id(TaskId::new(), input, max_retries)
    }

    pub fn with_id(id: TaskId, input: Value, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Pending,
            stage: 0,
            progress: 0.0,
            retry_count: 0,
            max_retries,
            last_error: None,
            input,
            stage_results: BTreeMap::new(),
            created_at: now,
            started_at: None,
            completed_at: None,
            resume_at: None,
            updated_at: now,
        }
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// A `failed` task whose last error was transient and that still has budget.
    ///
    /// Left behind when a process stops between recording a failure and
    /// scheduling its retry.
    pub fn has_pending_retry(&self) -> bool {
        self.status == TaskStatus::Failed
            && self.has_retry_budget()
            && matches!(
                self.last_error,
                Some(TaskError {
                    kind: FailureKind::TransientStageError,
                    ..
                })
            )
    }

    /// Whether `run` has nothing left to do for this task.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
            || (self.status == TaskStatus::Failed && !self.has_pending_retry())
    }
}

/// Partial update written together with a status compare-and-swap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub stage: Option<usize>,
    pub progress: Option<f64>,
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<TaskError>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resume_at: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: usize) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn error(mut self, error: Option<TaskError>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn resume_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.resume_at = Some(at);
        self
    }

    /// Apply to a task. Progress is clamped to [0, 1] and never decreases.
    pub fn apply(&self, task: &mut Task) {
        if let Some(stage) = self.stage {
            task.stage = stage;
        }
        if let Some(progress) = self.progress {
            task.progress = task.progress.max(progress.clamp(0.0, 1.0));
        }
        if let Some(retry_count) = self.retry_count {
            task.retry_count = retry_count.min(task.max_retries);
        }
        if let Some(error) = &self.last_error {
            task.last_error = error.clone();
        }
        if let Some(at) = self.started_at {
            task.started_at.get_or_insert(at);
        }
        if let Some(at) = self.completed_at {
            task.completed_at = Some(at);
        }
        if let Some(at) = self.resume_at {
            task.resume_at = at;
        }
        task.updated_at = Utc::now();
    }
}

/// How many failed sub-units a fan-out stage tolerates before failing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTolerance {
    /// Any failed sub-unit fails the stage
    #[default]
    Strict,
    MaxFailures(usize),
    MaxFailureRatio(f64),
}

impl FailureTolerance {
    pub fn tolerated(&self, total: usize) -> usize {
        match self {
            FailureTolerance::Strict => 0,
            FailureTolerance::MaxFailures(n) => *n,
            FailureTolerance::MaxFailureRatio(ratio) => {
                (ratio.clamp(0.0, 1.0) * total as f64).floor() as usize
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageMode {
    #[default]
    Single,
    FanOut {
        concurrency: usize,
        tolerance: FailureTolerance,
        sub_unit_max_attempts: u32,
    },
}

pub const DEFAULT_SUB_UNIT_ATTEMPTS: u32 = 3;

/// Immutable description of one pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: String,
    /// Assigned by `Pipeline::new` from the stage's position.
    pub ordinal: usize,
    pub mode: StageMode,
    /// Share of overall progress this stage accounts for.
    pub weight: f64,
}

impl StageDescriptor {
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ordinal: 0,
            mode: StageMode::Single,
            weight: 1.0,
        }
    }

    pub fn fan_out(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            ordinal: 0,
            mode: StageMode::FanOut {
                concurrency,
                tolerance: FailureTolerance::Strict,
                sub_unit_max_attempts: DEFAULT_SUB_UNIT_ATTEMPTS,
            },
            weight: 1.0,
        }
    }

    pub fn with_tolerance(mut self, tolerance: FailureTolerance) -> Self {
        if let StageMode::FanOut { tolerance: t, .. } = &mut self.mode {
            *t = tolerance;
        }
        self
    }

    pub fn with_sub_unit_attempts(mut self, attempts: u32) -> Self {
        if let StageMode::FanOut {
            sub_unit_max_attempts,
            ..
        } = &mut self.mode
        {
            *sub_unit_max_attempts = attempts;
        }
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn is_fan_out(&self) -> bool {
        matches!(self.mode, StageMode::FanOut { .. })
    }

    /// Statuses in which this stage counts as active.
    pub fn active_statuses(&self) -> [TaskStatus; 1] {
        [TaskStatus::running(self.ordinal)]
    }

    pub fn is_active_in(&self, status: &TaskStatus) -> bool {
        self.active_statuses().contains(status)
    }
}

/// Ordered, validated set of stages. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<StageDescriptor>,
    total_weight: f64,
}

impl Pipeline {
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, OrchestratorError> {
        if stages.is_empty() {
            return Err(OrchestratorError::InvalidPipeline {
                reason: "pipeline has no stages".to_string(),
            });
        }

        let mut seen = HashSet::new();
        let mut ordered = Vec::with_capacity(stages.len());
        for (ordinal, mut stage) in stages.into_iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(OrchestratorError::InvalidPipeline {
                    reason: format!("stage {ordinal} has an empty name"),
                });
            }
            if !seen.insert(stage.name.clone()) {
                return Err(OrchestratorError::InvalidPipeline {
                    reason: format!("duplicate stage name '{}'", stage.name),
                });
            }
            if !(stage.weight.is_finite() && stage.weight >= 0.0) {
                return Err(OrchestratorError::InvalidPipeline {
                    reason: format!("stage '{}' has invalid weight {}", stage.name, stage.weight),
                });
            }
            if let StageMode::FanOut {
                concurrency,
                tolerance,
                sub_unit_max_attempts,
            } = &stage.mode
            {
                if *concurrency == 0 {
                    return Err(OrchestratorError::InvalidPipeline {
                        reason: format!("fan-out stage '{}' has zero concurrency", stage.name),
                    });
                }
                if *sub_unit_max_attempts == 0 {
                    return Err(OrchestratorError::InvalidPipeline {
                        reason: format!("fan-out stage '{}' allows zero attempts", stage.name),
                    });
                }
                if let FailureTolerance::MaxFailureRatio(ratio) = tolerance {
                    if !(0.0..=1.0).contains(ratio) {
                        return Err(OrchestratorError::InvalidPipeline {
                            reason: format!(
                                "fan-out stage '{}' has tolerance ratio {} outside [0, 1]",
                                stage.name, ratio
                            ),
                        });
                    }
                }
            }
            stage.ordinal = ordinal;
            ordered.push(stage);
        }

        let total_weight = ordered.iter().map(|s| s.weight).sum();
        Ok(Self {
            stages: ordered,
            total_weight,
        })
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, ordinal: usize) -> Option<&StageDescriptor> {
        self.stages.get(ordinal)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn is_last(&self, ordinal: usize) -> bool {
        ordinal + 1 == self.stages.len()
    }

    /// Overall progress with `ordinal` stages complete and `fraction` of the next one done.
    pub fn progress_at(&self, ordinal: usize, fraction: f64) -> f64 {
        if ordinal >= self.stages.len() {
            return 1.0;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if self.total_weight <= 0.0 {
            return (ordinal as f64 + fraction) / self.stages.len() as f64;
        }
        let done: f64 = self.stages[..ordinal].iter().map(|s| s.weight).sum();
        ((done + self.stages[ordinal].weight * fraction) / self.total_weight).clamp(0.0, 1.0)
    }
}

/// Read-only view handed to an agent: task input plus prior stage outputs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub stage: String,
    /// 1-based attempt number for this stage.
    pub attempt: u32,
    input: Arc<Value>,
    outputs: Arc<BTreeMap<String, Value>>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task: &Task, stage: &str, cancel: CancellationToken) -> Self {
        Self {
            task_id: task.id.clone(),
            stage: stage.to_string(),
            attempt: task.retry_count + 1,
            input: Arc::new(task.input.clone()),
            outputs: Arc::new(task.stage_results.clone()),
            cancel,
        }
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.outputs.get(stage)
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    /// Cooperative cancellation for long-running agents.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One item of a fan-out stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubUnitInput {
    pub index: usize,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubUnitOutcome {
    Succeeded(Value),
    /// Final error after retries were exhausted or a permanent error.
    Failed(StageError),
    /// Never started because the task was cancelled.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubUnitResult {
    pub index: usize,
    pub outcome: SubUnitOutcome,
    pub attempts: u32,
}

impl SubUnitResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SubUnitOutcome::Succeeded(_))
    }
}
