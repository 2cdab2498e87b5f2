// Task status state machine
//
// Pure rule set: a transition table derived from the number of configured
// stages. Holds no mutable state; every status change in the orchestrator
// goes through `apply` or `check` first.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::TransitionError;
use super::types::{Pipeline, Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskEvent {
    /// Pipeline start from `pending`
    Start,
    /// Current stage produced its result
    StageSucceeded,
    /// Current stage failed (after any sub-unit retries)
    StageFailed,
    /// Failed task re-enters the retry path
    ScheduleRetry,
    /// Backoff elapsed, re-enter the failed stage
    Resume,
    Cancel,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskEvent::Start => "start",
            TaskEvent::StageSucceeded => "stage_succeeded",
            TaskEvent::StageFailed => "stage_failed",
            TaskEvent::ScheduleRetry => "schedule_retry",
            TaskEvent::Resume => "resume",
            TaskEvent::Cancel => "cancel",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStateMachine {
    stage_count: usize,
}

impl TaskStateMachine {
    pub fn new(stage_count: usize) -> Self {
        Self { stage_count }
    }

    pub fn for_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(pipeline.len())
    }

    pub fn stage_count(&self) -> usize {
        self.stage_count
    }

    /// Every legal status for this pipeline.
    pub fn states(&self) -> Vec<TaskStatus> {
        let mut states = vec![TaskStatus::Pending];
        states.extend((0..self.stage_count).map(TaskStatus::running));
        states.extend([
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Retrying,
        ]);
        states
    }

    pub fn is_legal(&self, status: &TaskStatus) -> bool {
        match status {
            TaskStatus::Running { stage } => *stage < self.stage_count,
            _ => true,
        }
    }

    pub fn is_terminal(&self, status: &TaskStatus) -> bool {
        status.is_terminal()
    }

    /// Terminal for this task, counting a `failed` status with no budget left.
    pub fn is_terminal_for(&self, task: &Task) -> bool {
        task.status.is_terminal() || (task.status == TaskStatus::Failed && !task.has_retry_budget())
    }

    /// Outgoing edges of the transition graph, without task-specific guards.
    pub fn successors(&self, from: &TaskStatus) -> Vec<TaskStatus> {
        if !self.is_legal(from) {
            return Vec::new();
        }
        match from {
            TaskStatus::Pending => {
                let mut next = Vec::new();
                if self.stage_count > 0 {
                    next.push(TaskStatus::running(0));
                }
                next.push(TaskStatus::Cancelled);
                next
            }
            TaskStatus::Running { stage } => vec![
                self.after_stage(*stage),
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ],
            TaskStatus::Failed => vec![TaskStatus::Retrying, TaskStatus::Cancelled],
            TaskStatus::Retrying => {
                let mut next: Vec<TaskStatus> =
                    (0..self.stage_count).map(TaskStatus::running).collect();
                next.push(TaskStatus::Cancelled);
                next
            }
            TaskStatus::Completed | TaskStatus::Cancelled => Vec::new(),
        }
    }

    /// Graph-level check: is `to` directly reachable from `from`.
    pub fn validate(&self, from: &TaskStatus, to: &TaskStatus) -> bool {
        self.successors(from).contains(to)
    }

    /// Graph check plus the task-specific guards (retry budget, resume point).
    pub fn check(&self, task: &Task, to: &TaskStatus) -> Result<(), TransitionError> {
        if !self.validate(&task.status, to) {
            return Err(TransitionError::InvalidTransition {
                from: task.status.clone(),
                to: to.clone(),
            });
        }

        match (&task.status, to) {
            (TaskStatus::Failed, TaskStatus::Retrying) if !task.has_retry_budget() => {
                Err(TransitionError::RetryBudgetExhausted {
                    retry_count: task.retry_count,
                    max_retries: task.max_retries,
                })
            }
            (TaskStatus::Failed, TaskStatus::Cancelled) if !task.has_retry_budget() => {
                Err(TransitionError::InvalidTransition {
                    from: task.status.clone(),
                    to: to.clone(),
                })
            }
            (TaskStatus::Retrying, TaskStatus::Running { stage }) if *stage != task.stage => {
                Err(TransitionError::ResumePointMismatch {
                    expected: task.stage,
                    actual: *stage,
                })
            }
            _ => Ok(()),
        }
    }

    /// Compute the status an event leads to from the task's current status.
    pub fn apply(&self, task: &Task, event: TaskEvent) -> Result<TaskStatus, TransitionError> {
        let to = match (&task.status, event) {
            (TaskStatus::Pending, TaskEvent::Start) => TaskStatus::running(0),
            (TaskStatus::Running { stage }, TaskEvent::StageSucceeded) => {
                if *stage >= self.stage_count {
                    return Err(TransitionError::StageOutOfRange {
                        ordinal: *stage,
                        stages: self.stage_count,
                    });
                }
                self.after_stage(*stage)
            }
            (TaskStatus::Running { .. }, TaskEvent::StageFailed) => TaskStatus::Failed,
            (TaskStatus::Failed, TaskEvent::ScheduleRetry) => TaskStatus::Retrying,
            (TaskStatus::Retrying, TaskEvent::Resume) => {
                if task.stage >= self.stage_count {
                    return Err(TransitionError::StageOutOfRange {
                        ordinal: task.stage,
                        stages: self.stage_count,
                    });
                }
                TaskStatus::running(task.stage)
            }
            (from, TaskEvent::Cancel) if !from.is_terminal() => TaskStatus::Cancelled,
            (from, event) => {
                return Err(TransitionError::NoTransition {
                    from: from.clone(),
                    event: event.to_string(),
                })
            }
        };

        self.check(task, &to)?;
        tracing::debug!(
            task_id = %task.id,
            from = %task.status,
            to = %to,
            event = %event,
            "Valid transition"
        );
        Ok(to)
    }

    fn after_stage(&self, stage: usize) -> TaskStatus {
        if stage + 1 >= self.stage_count {
            TaskStatus::Completed
        } else {
            TaskStatus::running(stage + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_in(status: TaskStatus, stage: usize, retry_count: u32, max_retries: u32) -> Task {
        let mut task = Task::new(json!({}), max_retries);
        task.status = status;
        task.stage = stage;
        task.retry_count = retry_count;
        task
    }

    #[test]
    fn test_happy_path_walk() {
        let sm = TaskStateMachine::new(3);
        let mut task = task_in(TaskStatus::Pending, 0, 0, 3);

        task.status = sm.apply(&task, TaskEvent::Start).unwrap();
        assert_eq!(task.status, TaskStatus::running(0));

        task.status = sm.apply(&task, TaskEvent::StageSucceeded).unwrap();
        assert_eq!(task.status, TaskStatus::running(1));

        task.status = sm.apply(&task, TaskEvent::StageSucceeded).unwrap();
        assert_eq!(task.status, TaskStatus::running(2));

        task.status = sm.apply(&task, TaskEvent::StageSucceeded).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        let sm = TaskStateMachine::new(2);
        assert!(sm.successors(&TaskStatus::Completed).is_empty());
        assert!(sm.successors(&TaskStatus::Cancelled).is_empty());

        let done = task_in(TaskStatus::Completed, 1, 0, 3);
        assert!(matches!(
            sm.apply(&done, TaskEvent::Cancel),
            Err(TransitionError::NoTransition { .. })
        ));
    }

    #[test]
    fn test_cannot_skip_stages() {
        let sm = TaskStateMachine::new(3);
        assert!(!sm.validate(&TaskStatus::running(0), &TaskStatus::running(2)));
        assert!(!sm.validate(&TaskStatus::Pending, &TaskStatus::running(1)));
        assert!(!sm.validate(&TaskStatus::running(0), &TaskStatus::Completed));
        assert!(sm.validate(&TaskStatus::running(2), &TaskStatus::Completed));
    }

    #[test]
    fn test_retry_requires_budget() {
        let sm = TaskStateMachine::new(3);
        let with_budget = task_in(TaskStatus::Failed, 1, 2, 3);
        assert_eq!(
            sm.apply(&with_budget, TaskEvent::ScheduleRetry).unwrap(),
            TaskStatus::Retrying
        );

        let exhausted = task_in(TaskStatus::Failed, 1, 3, 3);
        assert!(matches!(
            sm.apply(&exhausted, TaskEvent::ScheduleRetry),
            Err(TransitionError::RetryBudgetExhausted {
                retry_count: 3,
                max_retries: 3
            })
        ));
        assert!(sm.is_terminal_for(&exhausted));
        assert!(!sm.is_terminal_for(&with_budget));
    }

    #[test]
    fn test_resume_targets_failed_stage_only() {
        let sm = TaskStateMachine::new(3);
        let retrying = task_in(TaskStatus::Retrying, 2, 1, 3);
        assert_eq!(
            sm.apply(&retrying, TaskEvent::Resume).unwrap(),
            TaskStatus::running(2)
        );
        assert!(matches!(
            sm.check(&retrying, &TaskStatus::running(0)),
            Err(TransitionError::ResumePointMismatch {
                expected: 2,
                actual: 0
            })
        ));
    }

    #[test]
    fn test_cancel_from_every_non_terminal_state() {
        let sm = TaskStateMachine::new(2);
        for status in [
            TaskStatus::Pending,
            TaskStatus::running(0),
            TaskStatus::running(1),
            TaskStatus::Retrying,
            TaskStatus::Failed,
        ] {
            let task = task_in(status.clone(), 0, 1, 3);
            assert_eq!(
                sm.apply(&task, TaskEvent::Cancel).unwrap(),
                TaskStatus::Cancelled,
                "cancel from {status}"
            );
        }
    }

    #[test]
    fn test_exhausted_failure_rejects_cancel() {
        let sm = TaskStateMachine::new(2);
        let exhausted = task_in(TaskStatus::Failed, 0, 3, 3);
        assert!(sm.apply(&exhausted, TaskEvent::Cancel).is_err());
    }

    #[test]
    fn test_out_of_range_stage_is_illegal() {
        let sm = TaskStateMachine::new(2);
        assert!(!sm.is_legal(&TaskStatus::running(2)));
        assert!(sm.successors(&TaskStatus::running(5)).is_empty());
        assert_eq!(sm.states().len(), 2 + 5);
    }
}
