// Task driver
//
// Delivers `run` invocations to the orchestrator: one active driver per task id,
// and a retrying task is re-run after its backoff. The single-flight claim is
// released while waiting out a backoff.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::OrchestratorError;
use super::orchestrator::{Orchestrator, RunOutcome};
use super::types::TaskId;

#[derive(Clone)]
pub struct TaskDriver {
    orchestrator: Arc<Orchestrator>,
    in_flight: Arc<Mutex<HashSet<TaskId>>>,
    shutdown: CancellationToken,
}

struct Claim {
    in_flight: Arc<Mutex<HashSet<TaskId>>>,
    task_id: TaskId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.task_id);
        }
    }
}

impl TaskDriver {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let shutdown = orchestrator.shutdown_token().clone();
        Self {
            orchestrator,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn is_in_flight(&self, task_id: &TaskId) -> bool {
        self.in_flight
            .lock()
            .map(|in_flight| in_flight.contains(task_id))
            .unwrap_or(false)
    }

    fn claim(&self, task_id: &TaskId) -> Option<Claim> {
        let mut in_flight = self.in_flight.lock().ok()?;
        if !in_flight.insert(task_id.clone()) {
            return None;
        }
        Some(Claim {
            in_flight: self.in_flight.clone(),
            task_id: task_id.clone(),
        })
    }

    /// Drive a task in the background. Returns `None` if it is already being driven.
    pub fn spawn(
        &self,
        task_id: TaskId,
    ) -> Option<JoinHandle<Result<RunOutcome, OrchestratorError>>> {
        let claim = self.claim(&task_id)?;
        let driver = self.clone();
        Some(tokio::spawn(async move { driver.drive(task_id, claim).await }))
    }

    /// Drive a task until it finishes or shutdown is requested.
    pub async fn run_to_end(&self, task_id: &TaskId) -> Result<RunOutcome, OrchestratorError> {
        let claim = self
            .claim(task_id)
            .ok_or_else(|| OrchestratorError::AlreadyRunning(task_id.clone()))?;
        self.drive(task_id.clone(), claim).await
    }

    async fn drive(&self, task_id: TaskId, claim: Claim) -> Result<RunOutcome, OrchestratorError> {
        let mut claim = claim;
        loop {
            let outcome = self.orchestrator.run(&task_id).await?;
            let RunOutcome::RetryScheduled { delay, attempt, .. } = &outcome else {
                info!(task_id = %task_id, ?outcome, "Task driver finished");
                return Ok(outcome);
            };

            debug!(
                task_id = %task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Waiting out backoff"
            );
            drop(claim);
            if self
                .shutdown
                .run_until_cancelled(tokio::time::sleep(*delay))
                .await
                .is_none()
            {
                return Ok(RunOutcome::Interrupted);
            }

            claim = match self.claim(&task_id) {
                Some(claim) => claim,
                None => {
                    debug!(task_id = %task_id, "Another driver picked up the task");
                    return Ok(outcome);
                }
            };
        }
    }
}
