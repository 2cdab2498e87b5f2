// Pipeline orchestrator
//
// Drives one task at a time through the configured stages. All status changes
// are computed by the TaskStateMachine and written with a compare-and-swap, so
// a concurrent cancel and a running stage can never both win from the same
// prior status. Backoff is never awaited here: a retryable failure schedules a
// resume time and returns, and the next `run` call picks the task up again.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::error::{ErrorKind, FailureKind, OrchestratorError, StageError, TransitionError};
use super::limiter::{aggregate, ConcurrencyLimiter};
use super::progress::{ProgressEvent, ProgressKind, ProgressSink, TracingSink};
use super::registry::{Agent, AgentRegistry};
use super::retry::RetryPolicy;
use super::state_machine::{TaskEvent, TaskStateMachine};
use super::store::TaskStore;
use super::types::{
    Pipeline, StageDescriptor, StageMode, SubUnitInput, SubUnitOutcome, Task, TaskContext,
    TaskError, TaskId, TaskPatch, TaskStatus,
};
use crate::observability::{pipeline_metrics, OperationTimer};
use crate::telemetry::{create_task_span, generate_correlation_id};

/// Default task-level retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Attempts `cancel` makes against a contended status before giving up.
const CANCEL_CAS_ATTEMPTS: usize = 8;

/// How often a running stage re-reads the stored status for cancellations made elsewhere.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How a single `run` call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// Failed with no retry left, or with a permanent error.
    Failed(TaskError),
    Cancelled,
    /// A retry is scheduled; call `run` again once `resume_at` has passed.
    RetryScheduled {
        stage: String,
        attempt: u32,
        resume_at: DateTime<Utc>,
        delay: Duration,
    },
    /// Process shutdown stopped the run. Status is left as-is for a later resume.
    Interrupted,
    /// The task was already finished when `run` was called; no agent was invoked.
    AlreadyFinished(TaskStatus),
}

impl RunOutcome {
    /// Whether another `run` call may make progress.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            RunOutcome::RetryScheduled { .. } | RunOutcome::Interrupted
        )
    }
}

/// Caller-facing snapshot of a task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Name of the current (or resume) stage.
    pub stage: Option<String>,
    pub progress: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<TaskError>,
    pub resume_at: Option<DateTime<Utc>>,
}

impl TaskReport {
    /// Still working after at least one failed attempt.
    pub fn is_degraded(&self) -> bool {
        self.retry_count > 0 && !self.status.is_terminal() && self.status != TaskStatus::Failed
    }
}

pub struct OrchestratorBuilder {
    pipeline: Pipeline,
    registry: AgentRegistry,
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn ProgressSink>,
    retry: RetryPolicy,
    max_retries: u32,
    shutdown: CancellationToken,
}

impl OrchestratorBuilder {
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Retry budget given to tasks created with `submit`.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Fails with `UnknownStage` if any pipeline stage has no agent.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        if let Some(stage) = self.registry.missing_stages(&self.pipeline).into_iter().next() {
            return Err(OrchestratorError::UnknownStage { stage });
        }

        info!(
            stages = self.pipeline.len(),
            max_retries = self.max_retries,
            "Orchestrator configured"
        );

        Ok(Orchestrator {
            machine: TaskStateMachine::for_pipeline(&self.pipeline),
            pipeline: Arc::new(self.pipeline),
            registry: self.registry,
            store: self.store,
            sink: self.sink,
            retry: self.retry,
            max_retries: self.max_retries,
            shutdown: self.shutdown,
            active: Mutex::new(HashMap::new()),
            run_seq: AtomicU64::new(0),
        })
    }
}

pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    machine: TaskStateMachine,
    registry: AgentRegistry,
    store: Arc<dyn TaskStore>,
    sink: Arc<dyn ProgressSink>,
    retry: RetryPolicy,
    max_retries: u32,
    shutdown: CancellationToken,
    /// Cancellation tokens of runs active in this process.
    active: Mutex<HashMap<TaskId, (u64, CancellationToken)>>,
    run_seq: AtomicU64,
}

/// Removes a run's token from the active map when the run ends.
struct ActiveRun<'a> {
    orchestrator: &'a Orchestrator,
    task_id: TaskId,
    seq: u64,
    token: CancellationToken,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.orchestrator.active.lock() {
            if matches!(active.get(&self.task_id), Some((seq, _)) if *seq == self.seq) {
                active.remove(&self.task_id);
            }
        }
    }
}

/// Where a stage attempt left the task.
enum StageStep {
    Continue(Task),
    Done(RunOutcome),
}

impl Orchestrator {
    pub fn builder(
        pipeline: Pipeline,
        registry: AgentRegistry,
        store: Arc<dyn TaskStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            pipeline,
            registry,
            store,
            sink: Arc::new(TracingSink),
            retry: RetryPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn state_machine(&self) -> &TaskStateMachine {
        &self.machine
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn active_runs(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    /// Create a `pending` task with the default retry budget.
    pub async fn submit(&self, input: Value) -> Result<TaskId, OrchestratorError> {
        self.submit_task(Task::new(input, self.max_retries)).await
    }

    /// Store a caller-built task. It must be `pending`.
    pub async fn submit_task(&self, task: Task) -> Result<TaskId, OrchestratorError> {
        if task.status != TaskStatus::Pending {
            return Err(TransitionError::InvalidTransition {
                from: task.status.clone(),
                to: TaskStatus::Pending,
            }
            .into());
        }
        let task_id = task.id.clone();
        let max_retries = task.max_retries;
        self.store.insert(task).await?;
        info!(task_id = %task_id, max_retries, "Task submitted");
        Ok(task_id)
    }

    pub async fn status(&self, task_id: &TaskId) -> Result<TaskReport, OrchestratorError> {
        let task = self.store.load(task_id).await?;
        Ok(TaskReport {
            stage: self.pipeline.stage(task.stage).map(|s| s.name.clone()),
            task_id: task.id,
            status: task.status,
            progress: task.progress,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            last_error: task.last_error,
            resume_at: task.resume_at,
        })
    }

    /// Cancel a task. Returns `false` if it had already reached a terminal state.
    ///
    /// A run active in this process observes the cancellation at its next stage or
    /// sub-unit boundary. Runs elsewhere see the stored status when their stage
    /// returns or at their next status poll.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool, OrchestratorError> {
        for _ in 0..CANCEL_CAS_ATTEMPTS {
            let task = self.store.load(task_id).await?;
            if self.machine.is_terminal_for(&task) {
                debug!(task_id = %task_id, status = %task.status, "Cancel ignored for finished task");
                return Ok(false);
            }

            let to = self.machine.apply(&task, TaskEvent::Cancel)?;
            if self
                .store
                .compare_and_swap_status(task_id, &task.status, to, TaskPatch::new().resume_at(None))
                .await?
            {
                if let Ok(active) = self.active.lock() {
                    if let Some((_, token)) = active.get(task_id) {
                        token.cancel();
                    }
                }
                pipeline_metrics().record_task_cancelled();
                info!(task_id = %task_id, from = %task.status, "Task cancelled");
                self.publish(task_id, ProgressKind::TaskCancelled);
                return Ok(true);
            }
            debug!(task_id = %task_id, "Cancel lost a status race, re-reading");
        }

        let found = self.store.load(task_id).await?.status;
        Err(OrchestratorError::ConcurrentModification {
            task_id: task_id.clone(),
            expected: found.clone(),
            found,
        })
    }

    /// Put a `failed` task with remaining retry budget back on the retry path,
    /// resuming at the stage that failed.
    pub async fn retry(&self, task_id: &TaskId) -> Result<(), OrchestratorError> {
        let task = self.store.load(task_id).await?;
        let to = self.machine.apply(&task, TaskEvent::ScheduleRetry)?;
        let patch = TaskPatch::new().resume_at(Some(Utc::now()));
        if !self
            .store
            .compare_and_swap_status(task_id, &task.status, to, patch)
            .await?
        {
            let found = self.store.load(task_id).await?.status;
            return Err(OrchestratorError::ConcurrentModification {
                task_id: task_id.clone(),
                expected: task.status,
                found,
            });
        }
        info!(
            task_id = %task_id,
            stage = task.stage,
            retry_count = task.retry_count,
            "Manual retry scheduled"
        );
        Ok(())
    }

    /// Drive a task until it finishes, schedules a retry, or is stopped.
    ///
    /// Safe to call again after a crash: the task resumes from its persisted status
    /// and stages whose results are already recorded are not executed again.
    pub async fn run(&self, task_id: &TaskId) -> Result<RunOutcome, OrchestratorError> {
        let span = create_task_span(task_id.as_str(), &generate_correlation_id());
        async {
            let guard = self.register(task_id);
            let outcome = self.drive(task_id, &guard.token).await;
            match &outcome {
                Ok(outcome) => debug!(?outcome, "Run finished"),
                Err(e) => error!(error = %e, "Run aborted"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    fn register(&self, task_id: &TaskId) -> ActiveRun<'_> {
        let seq = self.run_seq.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        if let Ok(mut active) = self.active.lock() {
            if active
                .insert(task_id.clone(), (seq, token.clone()))
                .is_some()
            {
                warn!(task_id = %task_id, "Task already has an active run in this process");
            }
        }
        ActiveRun {
            orchestrator: self,
            task_id: task_id.clone(),
            seq,
            token,
        }
    }

    async fn drive(
        &self,
        task_id: &TaskId,
        token: &CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        let mut task = self.store.load(task_id).await?;
        if task.is_finished() {
            debug!(status = %task.status, "Task already finished");
            return Ok(RunOutcome::AlreadyFinished(task.status));
        }

        loop {
            if self.shutdown.is_cancelled() {
                info!(status = %task.status, "Shutdown requested, leaving task resumable");
                return Ok(RunOutcome::Interrupted);
            }
            if token.is_cancelled() {
                task = self.store.load(task_id).await?;
                if task.status == TaskStatus::Cancelled {
                    return Ok(RunOutcome::Cancelled);
                }
            }

            task = match task.status.clone() {
                TaskStatus::Completed => return Ok(RunOutcome::Completed),
                TaskStatus::Cancelled => return Ok(RunOutcome::Cancelled),
                TaskStatus::Failed if task.has_pending_retry() => {
                    info!(
                        stage = task.stage,
                        retry_count = task.retry_count,
                        "Scheduling retry left pending by an earlier run"
                    );
                    let decision =
                        self.retry
                            .should_retry(task.retry_count, task.max_retries, ErrorKind::Transient);
                    let stage = self.stage_name(task.stage);
                    return self.schedule_retry(&task, &stage, decision.delay).await;
                }
                TaskStatus::Failed => {
                    return Ok(match task.last_error.clone() {
                        Some(error) => RunOutcome::Failed(error),
                        None => RunOutcome::AlreadyFinished(TaskStatus::Failed),
                    })
                }
                TaskStatus::Pending => {
                    let to = self.machine.apply(&task, TaskEvent::Start)?;
                    let patch = TaskPatch::new()
                        .stage(0)
                        .started_at(Utc::now())
                        .progress(self.pipeline.progress_at(0, 0.0));
                    match self.transition(&task, to, patch).await? {
                        Ok(task) => task,
                        Err(outcome) => return Ok(outcome),
                    }
                }
                TaskStatus::Retrying => {
                    if let Some(resume_at) = task.resume_at {
                        let now = Utc::now();
                        if resume_at > now {
                            let stage = self.stage_name(task.stage);
                            return Ok(RunOutcome::RetryScheduled {
                                stage,
                                attempt: task.retry_count,
                                resume_at,
                                delay: (resume_at - now).to_std().unwrap_or_default(),
                            });
                        }
                    }
                    let to = self.machine.apply(&task, TaskEvent::Resume)?;
                    info!(stage = task.stage, retry_count = task.retry_count, "Resuming task");
                    match self
                        .transition(&task, to, TaskPatch::new().resume_at(None))
                        .await?
                    {
                        Ok(task) => task,
                        Err(outcome) => return Ok(outcome),
                    }
                }
                TaskStatus::Running { stage } => match self.run_stage(task, stage, token).await? {
                    StageStep::Continue(task) => task,
                    StageStep::Done(outcome) => return Ok(outcome),
                },
            };
        }
    }

    async fn run_stage(
        &self,
        task: Task,
        ordinal: usize,
        token: &CancellationToken,
    ) -> Result<StageStep, OrchestratorError> {
        let descriptor = self
            .pipeline
            .stage(ordinal)
            .ok_or(TransitionError::StageOutOfRange {
                ordinal,
                stages: self.pipeline.len(),
            })?
            .clone();
        if task.stage != ordinal {
            return Err(TransitionError::ResumePointMismatch {
                expected: task.stage,
                actual: ordinal,
            }
            .into());
        }

        if task.stage_results.contains_key(&descriptor.name) {
            info!(stage = %descriptor.name, "Stage result already recorded, advancing");
            return self.advance(task, &descriptor).await;
        }

        if let Some(outcome) = self.superseded(&task, &descriptor.name).await? {
            return Ok(StageStep::Done(outcome));
        }

        let agent = match self.registry.resolve(&descriptor.name) {
            Ok(agent) => agent,
            Err(e) => {
                self.fail_fatally(&task, &descriptor, FailureKind::UnknownStage, &e)
                    .await?;
                return Err(e);
            }
        };

        let ctx = TaskContext::new(&task, &descriptor.name, token.clone());
        pipeline_metrics().record_stage_started();
        info!(stage = %descriptor.name, ordinal, attempt = ctx.attempt, "Stage started");
        self.publish(
            &task.id,
            ProgressKind::StageStarted {
                stage: descriptor.name.clone(),
                ordinal,
                attempt: ctx.attempt,
            },
        );

        let nudge = Arc::new(Notify::new());
        let watch = self
            .watch_for_cancel(&task.id, token, nudge.clone())
            .drop_guard();
        let timer = OperationTimer::new(&format!("stage {}", descriptor.name));
        let result = match &descriptor.mode {
            StageMode::Single => agent.execute(&ctx).await,
            StageMode::FanOut { .. } => self.run_fan_out(&ctx, agent, &descriptor, nudge).await,
        };
        timer.finish();
        drop(watch);

        if let Some(outcome) = self.superseded(&task, &descriptor.name).await? {
            return Ok(StageStep::Done(outcome));
        }

        match result {
            Ok(payload) => {
                self.store
                    .append_stage_result(&task.id, &descriptor.name, payload.clone())
                    .await?;
                // Advance from the status the stage ran under; a cancel that landed
                // after the check above loses the compare-and-swap there.
                let mut task = task;
                task.stage_results.insert(descriptor.name.clone(), payload);
                self.advance(task, &descriptor).await
            }
            Err(stage_error) => self.handle_failure(task, &descriptor, stage_error).await,
        }
    }

    async fn run_fan_out(
        &self,
        ctx: &TaskContext,
        agent: Arc<dyn Agent>,
        descriptor: &StageDescriptor,
        nudge: Arc<Notify>,
    ) -> Result<Value, StageError> {
        let StageMode::FanOut {
            concurrency,
            tolerance,
            sub_unit_max_attempts,
        } = descriptor.mode
        else {
            return agent.execute(ctx).await;
        };

        let inputs: Vec<SubUnitInput> = agent
            .plan_sub_units(ctx)
            .await?
            .into_iter()
            .enumerate()
            .map(|(index, payload)| SubUnitInput { index, payload })
            .collect();
        info!(
            stage = %descriptor.name,
            sub_units = inputs.len(),
            concurrency,
            "Fanning out stage"
        );

        let limiter = ConcurrencyLimiter::new(self.retry.clone(), sub_unit_max_attempts);
        let pipeline = self.pipeline.clone();
        let sink = self.sink.clone();
        let task_id = ctx.task_id.clone();
        let stage = descriptor.name.clone();
        let ordinal = descriptor.ordinal;

        let results = limiter
            .run_all(
                inputs,
                concurrency,
                ctx.cancellation(),
                |result, completed, total| {
                    if !matches!(result.outcome, SubUnitOutcome::Skipped) {
                        pipeline_metrics().record_sub_unit(result.is_success());
                    }
                    nudge.notify_one();
                    let fraction = completed as f64 / total as f64;
                    sink.publish(ProgressEvent::new(
                        task_id.clone(),
                        ProgressKind::Progress {
                            stage: stage.clone(),
                            progress: pipeline.progress_at(ordinal, fraction),
                            completed,
                            total,
                        },
                    ));
                },
                move |input| {
                    let agent = agent.clone();
                    async move { agent.execute_sub_unit(input.payload).await }
                },
            )
            .await;

        let skipped = results
            .iter()
            .filter(|r| matches!(r.outcome, SubUnitOutcome::Skipped))
            .count();
        if skipped > 0 {
            pipeline_metrics().record_sub_units_skipped(skipped as u64);
        }

        let summary = aggregate(&results, tolerance)?;
        if summary.failed > 0 {
            warn!(
                stage = %descriptor.name,
                failed = summary.failed,
                succeeded = summary.succeeded,
                "Fan-out stage tolerated failed sub-units"
            );
        }
        Ok(summary.payload)
    }

    /// Move past a stage whose result is recorded.
    async fn advance(
        &self,
        task: Task,
        descriptor: &StageDescriptor,
    ) -> Result<StageStep, OrchestratorError> {
        let to = self.machine.apply(&task, TaskEvent::StageSucceeded)?;
        let progress = self.pipeline.progress_at(descriptor.ordinal + 1, 0.0);
        let mut patch = TaskPatch::new().progress(progress);
        match &to {
            TaskStatus::Running { stage } => patch = patch.stage(*stage),
            TaskStatus::Completed => patch = patch.completed_at(Utc::now()).error(None),
            _ => {}
        }

        let task = match self.transition(&task, to.clone(), patch).await? {
            Ok(task) => task,
            Err(outcome) => return Ok(StageStep::Done(outcome)),
        };

        pipeline_metrics().record_stage_completed();
        info!(stage = %descriptor.name, progress, "Stage completed");
        if !descriptor.is_fan_out() {
            self.publish(
                &task.id,
                ProgressKind::Progress {
                    stage: descriptor.name.clone(),
                    progress,
                    completed: 1,
                    total: 1,
                },
            );
        }
        self.publish(
            &task.id,
            ProgressKind::StageCompleted {
                stage: descriptor.name.clone(),
                ordinal: descriptor.ordinal,
                progress,
            },
        );

        if to == TaskStatus::Completed {
            pipeline_metrics().record_task_completed();
            info!("Task completed");
            self.publish(&task.id, ProgressKind::TaskCompleted);
            return Ok(StageStep::Done(RunOutcome::Completed));
        }
        Ok(StageStep::Continue(task))
    }

    async fn handle_failure(
        &self,
        task: Task,
        descriptor: &StageDescriptor,
        stage_error: StageError,
    ) -> Result<StageStep, OrchestratorError> {
        pipeline_metrics().record_stage_failed();
        let task_error = TaskError::from_stage_error(&descriptor.name, &stage_error);
        let failed = self.machine.apply(&task, TaskEvent::StageFailed)?;
        let patch = TaskPatch::new()
            .retry_count(task.retry_count.saturating_add(1))
            .error(Some(task_error.clone()));

        let task = match self.transition(&task, failed, patch).await? {
            Ok(task) => task,
            Err(outcome) => return Ok(StageStep::Done(outcome)),
        };

        let decision = self
            .retry
            .should_retry(task.retry_count, task.max_retries, stage_error.kind());
        warn!(
            stage = %descriptor.name,
            retry_count = task.retry_count,
            max_retries = task.max_retries,
            kind = %task_error.kind,
            retry = decision.retry,
            error = %stage_error,
            "Stage failed"
        );

        if !decision.retry {
            pipeline_metrics().record_task_failed();
            self.publish(
                &task.id,
                ProgressKind::TaskFailed {
                    error: task_error.clone(),
                },
            );
            return Ok(StageStep::Done(RunOutcome::Failed(task_error)));
        }

        self.schedule_retry(&task, &descriptor.name, decision.delay)
            .await
            .map(StageStep::Done)
    }

    /// Move a `failed` task to `retrying` with a resume time `delay` from now.
    async fn schedule_retry(
        &self,
        task: &Task,
        stage: &str,
        delay: Duration,
    ) -> Result<RunOutcome, OrchestratorError> {
        let to = self.machine.apply(task, TaskEvent::ScheduleRetry)?;
        let now = Utc::now();
        let resume_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now);
        let task = match self
            .transition(task, to, TaskPatch::new().resume_at(Some(resume_at)))
            .await?
        {
            Ok(task) => task,
            Err(outcome) => return Ok(outcome),
        };

        pipeline_metrics().record_retry_scheduled();
        let delay_ms = delay.as_millis() as u64;
        info!(stage, attempt = task.retry_count, delay_ms, "Retry scheduled");
        self.publish(
            &task.id,
            ProgressKind::RetryScheduled {
                stage: stage.to_string(),
                attempt: task.retry_count,
                delay_ms,
            },
        );
        Ok(RunOutcome::RetryScheduled {
            stage: stage.to_string(),
            attempt: task.retry_count,
            resume_at,
            delay,
        })
    }

    /// Record a configuration failure on the task without spending retry budget.
    async fn fail_fatally(
        &self,
        task: &Task,
        descriptor: &StageDescriptor,
        kind: FailureKind,
        cause: &OrchestratorError,
    ) -> Result<(), OrchestratorError> {
        let task_error = TaskError {
            kind,
            message: cause.to_string(),
            stage: descriptor.name.clone(),
            at: Utc::now(),
        };
        let to = self.machine.apply(task, TaskEvent::StageFailed)?;
        match self
            .transition(task, to, TaskPatch::new().error(Some(task_error.clone())))
            .await?
        {
            Ok(_) => {
                pipeline_metrics().record_task_failed();
                self.publish(&task.id, ProgressKind::TaskFailed { error: task_error });
            }
            Err(outcome) => {
                debug!(
                    stage = %descriptor.name,
                    ?outcome,
                    "Fatal failure not recorded, task changed concurrently"
                );
            }
        }
        Ok(())
    }

    /// Re-read the task around a stage attempt. `Some` means the attempt must not
    /// start, or its result must be discarded.
    async fn superseded(
        &self,
        task: &Task,
        stage: &str,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        if self.shutdown.is_cancelled() {
            info!(stage, "Shutdown requested, leaving stage to a later run");
            return Ok(Some(RunOutcome::Interrupted));
        }
        let current = self.store.load(&task.id).await?;
        if current.status == task.status {
            return Ok(None);
        }
        if current.status == TaskStatus::Cancelled {
            info!(stage, "Task cancelled, discarding stage attempt");
            return Ok(Some(RunOutcome::Cancelled));
        }
        Err(OrchestratorError::ConcurrentModification {
            task_id: task.id.clone(),
            expected: task.status.clone(),
            found: current.status,
        })
    }

    /// Poll the stored status while a stage runs and fire the run token once the
    /// task shows up cancelled. Polls every `CANCEL_POLL_INTERVAL` and whenever
    /// `nudge` is notified. Cancelling the returned token stops the poll.
    fn watch_for_cancel(
        &self,
        task_id: &TaskId,
        token: &CancellationToken,
        nudge: Arc<Notify>,
    ) -> CancellationToken {
        let stop = CancellationToken::new();
        let store = self.store.clone();
        let task_id = task_id.clone();
        let token = token.clone();
        let watching = stop.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watching.cancelled() => break,
                    _ = token.cancelled() => break,
                    _ = nudge.notified() => {}
                    _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
                }
                match store.load(&task_id).await {
                    Ok(task) if task.status == TaskStatus::Cancelled => {
                        debug!(task_id = %task_id, "Cancellation found in store, stopping stage");
                        token.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(task_id = %task_id, error = %e, "Status poll failed"),
                }
            }
        });
        stop
    }

    /// Compare-and-swap from the task's current status. On a lost race, reports
    /// `Cancelled` if a cancel won, otherwise a concurrent modification error.
    async fn transition(
        &self,
        task: &Task,
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Result<Task, RunOutcome>, OrchestratorError> {
        if self
            .store
            .compare_and_swap_status(&task.id, &task.status, to.clone(), patch)
            .await?
        {
            debug!(from = %task.status, to = %to, "Status updated");
            return Ok(Ok(self.store.load(&task.id).await?));
        }

        let current = self.store.load(&task.id).await?;
        if current.status == TaskStatus::Cancelled {
            info!(from = %task.status, "Task was cancelled concurrently");
            return Ok(Err(RunOutcome::Cancelled));
        }
        Err(OrchestratorError::ConcurrentModification {
            task_id: task.id.clone(),
            expected: task.status.clone(),
            found: current.status,
        })
    }

    fn stage_name(&self, ordinal: usize) -> String {
        self.pipeline
            .stage(ordinal)
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }

    fn publish(&self, task_id: &TaskId, kind: ProgressKind) {
        self.sink.publish(ProgressEvent::new(task_id.clone(), kind));
    }
}
