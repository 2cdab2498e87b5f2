// Bounded fan-out execution
//
// A fixed pool of `limit` workers pulls sub-units from a shared queue. Each
// sub-unit is retried independently under the RetryPolicy; a sub-unit's final
// failure is recorded and never aborts its siblings. Results are pushed onto a
// results channel and collected before aggregation.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::{ErrorKind, StageError};
use super::retry::RetryPolicy;
use super::types::{FailureTolerance, SubUnitInput, SubUnitOutcome, SubUnitResult};

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    retry: RetryPolicy,
    max_attempts: u32,
}

impl ConcurrencyLimiter {
    pub fn new(retry: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            retry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run every sub-unit with at most `limit` in flight and return one result per sub-unit.
    ///
    /// If `cancel` fires, workers stop pulling new sub-units; those are reported as
    /// `Skipped`. In-flight sub-units finish their current attempt. `on_settled` is
    /// called on the collecting task as each result arrives.
    pub async fn run_all<F, Fut>(
        &self,
        inputs: Vec<SubUnitInput>,
        limit: usize,
        cancel: &CancellationToken,
        mut on_settled: impl FnMut(&SubUnitResult, usize, usize),
        work: F,
    ) -> Vec<SubUnitResult>
    where
        F: Fn(SubUnitInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StageError>> + Send + 'static,
    {
        let total = inputs.len();
        if total == 0 {
            return Vec::new();
        }

        let (queue_tx, queue_rx) = mpsc::channel::<SubUnitInput>(total);
        for input in inputs {
            // Capacity equals the item count, so this never waits.
            if queue_tx.send(input).await.is_err() {
                break;
            }
        }
        drop(queue_tx);

        let queue = Arc::new(Mutex::new(queue_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<SubUnitResult>();
        let work = Arc::new(work);
        let worker_count = limit.max(1).min(total);

        debug!(total, workers = worker_count, "Dispatching sub-units");

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let queue = queue.clone();
            let result_tx = result_tx.clone();
            let work = work.clone();
            let cancel = cancel.clone();
            let retry = self.retry.clone();
            let max_attempts = self.max_attempts;

            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = { queue.lock().await.recv().await };
                    let Some(input) = next else {
                        break;
                    };

                    let index = input.index;
                    let attempted = retry
                        .execute_with_retry(max_attempts, &cancel, |_attempt| (*work)(input.clone()))
                        .await;

                    let outcome = match attempted.result {
                        Ok(value) => SubUnitOutcome::Succeeded(value),
                        Err(error) => SubUnitOutcome::Failed(error),
                    };
                    debug!(
                        worker_id,
                        index,
                        attempts = attempted.attempts,
                        success = matches!(outcome, SubUnitOutcome::Succeeded(_)),
                        "Sub-unit settled"
                    );

                    let result = SubUnitResult {
                        index,
                        outcome,
                        attempts: attempted.attempts,
                    };
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            results.push(result);
            if let Some(last) = results.last() {
                on_settled(last, results.len(), total);
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Sub-unit worker panicked");
            }
        }

        // Anything left in the queue was never started.
        let mut queue_rx = queue.lock().await;
        while let Ok(input) = queue_rx.try_recv() {
            results.push(SubUnitResult {
                index: input.index,
                outcome: SubUnitOutcome::Skipped,
                attempts: 0,
            });
        }

        if results.len() < total {
            // A panicked worker loses its in-flight sub-unit; report it as failed.
            let mut seen = vec![false; total];
            for result in &results {
                if let Some(slot) = seen.get_mut(result.index) {
                    *slot = true;
                }
            }
            for (index, _) in seen.iter().enumerate().filter(|(_, s)| !**s) {
                results.push(SubUnitResult {
                    index,
                    outcome: SubUnitOutcome::Failed(StageError::permanent("sub-unit worker panicked")),
                    attempts: 0,
                });
            }
        }

        info!(
            total,
            succeeded = results.iter().filter(|r| r.is_success()).count(),
            skipped = results
                .iter()
                .filter(|r| matches!(r.outcome, SubUnitOutcome::Skipped))
                .count(),
            "Fan-out finished"
        );

        results
    }
}

/// Aggregate of a successful fan-out stage
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutSummary {
    pub payload: Value,
    pub succeeded: usize,
    pub failed: usize,
}

/// Fold sub-unit results into a stage result under the stage's tolerance.
///
/// The fold only depends on the set of results, not their arrival order.
pub fn aggregate(
    results: &[SubUnitResult],
    tolerance: FailureTolerance,
) -> Result<FanOutSummary, StageError> {
    let total = results.len();
    let tolerated = tolerance.tolerated(total);

    let mut ordered: Vec<&SubUnitResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.index);

    let mut items = Vec::new();
    let mut failures = Vec::new();
    for result in &ordered {
        match &result.outcome {
            SubUnitOutcome::Succeeded(value) => items.push(json!({
                "index": result.index,
                "attempts": result.attempts,
                "result": value,
            })),
            SubUnitOutcome::Failed(error) => failures.push((result.index, Some(error))),
            SubUnitOutcome::Skipped => failures.push((result.index, None)),
        }
    }

    if failures.len() > tolerated {
        let retryable = failures.iter().any(|(_, error)| match error {
            Some(error) => error.kind() == ErrorKind::Transient,
            None => true,
        });
        let last_message = failures
            .last()
            .map(|(index, error)| match error {
                Some(error) => format!("sub-unit {index}: {error}"),
                None => format!("sub-unit {index}: skipped"),
            })
            .unwrap_or_default();
        return Err(StageError::SubUnitPartialFailure {
            failed: failures.len(),
            total,
            tolerated,
            retryable,
            last_message,
        });
    }

    let failed_indices: Vec<usize> = failures.iter().map(|(index, _)| *index).collect();
    Ok(FanOutSummary {
        payload: json!({
            "items": items,
            "succeeded": items.len(),
            "failed": failed_indices,
        }),
        succeeded: items.len(),
        failed: failures.len(),
    })
}
