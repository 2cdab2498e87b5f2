// Error taxonomy for the stage pipeline
//
// Agents report failures as StageError values tagged transient or permanent.
// Configuration and programmer errors surface as OrchestratorError and are
// never retried.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::store::StoreError;
use super::types::{TaskId, TaskStatus};

/// Retry classification supplied by the agent, never inferred by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network, timeout or provider rate limit. Retryable.
    Transient,
    /// Invalid input or authorization failure. Never retried.
    Permanent,
}

/// Kind recorded on a failed task, covering every error class that can end a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientStageError,
    PermanentStageError,
    SubUnitPartialFailure,
    InvalidTransition,
    UnknownStage,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::TransientStageError => "transient_stage_error",
            FailureKind::PermanentStageError => "permanent_stage_error",
            FailureKind::SubUnitPartialFailure => "sub_unit_partial_failure",
            FailureKind::InvalidTransition => "invalid_transition",
            FailureKind::UnknownStage => "unknown_stage",
        };
        f.write_str(label)
    }
}

/// Failure of a stage or of a single fan-out sub-unit.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum StageError {
    #[error("transient stage error: {message}")]
    Transient { message: String },

    #[error("permanent stage error: {message}")]
    Permanent { message: String },

    #[error("{failed} of {total} sub-units failed (tolerated {tolerated}): {last_message}")]
    SubUnitPartialFailure {
        failed: usize,
        total: usize,
        tolerated: usize,
        /// Whether any failed sub-unit ended on a transient error.
        retryable: bool,
        last_message: String,
    },
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        StageError::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StageError::Permanent {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Transient { .. } => ErrorKind::Transient,
            StageError::Permanent { .. } => ErrorKind::Permanent,
            StageError::SubUnitPartialFailure { retryable, .. } => {
                if *retryable {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            StageError::Transient { .. } => FailureKind::TransientStageError,
            StageError::Permanent { .. } => FailureKind::PermanentStageError,
            StageError::SubUnitPartialFailure { .. } => FailureKind::SubUnitPartialFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("no transition for event {event} from {from}")]
    NoTransition { from: TaskStatus, event: String },

    #[error("retry budget exhausted ({retry_count}/{max_retries})")]
    RetryBudgetExhausted { retry_count: u32, max_retries: u32 },

    #[error("resume must target the failed stage {expected}, got {actual}")]
    ResumePointMismatch { expected: usize, actual: usize },

    #[error("stage ordinal {ordinal} outside pipeline of {stages} stages")]
    StageOutOfRange { ordinal: usize, stages: usize },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("no agent registered for stage '{stage}'")]
    UnknownStage { stage: String },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {task_id} was modified concurrently (expected {expected}, found {found})")]
    ConcurrentModification {
        task_id: TaskId,
        expected: TaskStatus,
        found: TaskStatus,
    },

    #[error("task {0} already has an active run")]
    AlreadyRunning(TaskId),

    #[error("invalid pipeline: {reason}")]
    InvalidPipeline { reason: String },

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(task_id) => OrchestratorError::TaskNotFound(task_id),
            other => OrchestratorError::Store(other),
        }
    }
}

impl OrchestratorError {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            OrchestratorError::InvalidTransition(_) => Some(FailureKind::InvalidTransition),
            OrchestratorError::UnknownStage { .. } => Some(FailureKind::UnknownStage),
            _ => None,
        }
    }
}
