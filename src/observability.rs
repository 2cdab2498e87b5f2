use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Pipeline execution counters
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub stages_started: AtomicU64,
    pub stages_completed: AtomicU64,
    pub stages_failed: AtomicU64,
    pub sub_units_succeeded: AtomicU64,
    pub sub_units_failed: AtomicU64,
    pub sub_units_skipped: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub dropped_events: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stage_started(&self) {
        self.stages_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_completed(&self) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_failed(&self) {
        self.stages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sub_unit(&self, succeeded: bool) {
        if succeeded {
            self.sub_units_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sub_units_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sub_units_skipped(&self, count: u64) {
        self.sub_units_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> PipelineStats {
        PipelineStats {
            stages_started: self.stages_started.load(Ordering::Relaxed),
            stages_completed: self.stages_completed.load(Ordering::Relaxed),
            stages_failed: self.stages_failed.load(Ordering::Relaxed),
            sub_units_succeeded: self.sub_units_succeeded.load(Ordering::Relaxed),
            sub_units_failed: self.sub_units_failed.load(Ordering::Relaxed),
            sub_units_skipped: self.sub_units_skipped.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            stages_started = stats.stages_started,
            stages_completed = stats.stages_completed,
            stages_failed = stats.stages_failed,
            sub_units_succeeded = stats.sub_units_succeeded,
            sub_units_failed = stats.sub_units_failed,
            sub_units_skipped = stats.sub_units_skipped,
            retries_scheduled = stats.retries_scheduled,
            tasks_completed = stats.tasks_completed,
            tasks_failed = stats.tasks_failed,
            tasks_cancelled = stats.tasks_cancelled,
            dropped_events = stats.dropped_events,
            "Pipeline metrics"
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PipelineStats {
    pub stages_started: u64,
    pub stages_completed: u64,
    pub stages_failed: u64,
    pub sub_units_succeeded: u64,
    pub sub_units_failed: u64,
    pub sub_units_skipped: u64,
    pub retries_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub dropped_events: u64,
}

/// Global metrics instance
static PIPELINE_METRICS: std::sync::LazyLock<PipelineMetrics> =
    std::sync::LazyLock::new(PipelineMetrics::new);

pub fn pipeline_metrics() -> &'static PipelineMetrics {
    &PIPELINE_METRICS
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}
