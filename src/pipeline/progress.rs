// Progress events and sinks
//
// The orchestrator publishes events synchronously and never waits on a sink.
// Sinks that forward elsewhere buffer through a bounded channel and drop on
// overflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::types::{TaskError, TaskId};
use crate::observability::pipeline_metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProgressKind {
    StageStarted {
        stage: String,
        ordinal: usize,
        attempt: u32,
    },
    Progress {
        stage: String,
        progress: f64,
        completed: usize,
        total: usize,
    },
    StageCompleted {
        stage: String,
        ordinal: usize,
        progress: f64,
    },
    RetryScheduled {
        stage: String,
        attempt: u32,
        delay_ms: u64,
    },
    TaskCompleted,
    TaskFailed {
        error: TaskError,
    },
    TaskCancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn new(task_id: TaskId, kind: ProgressKind) -> Self {
        Self {
            task_id,
            at: Utc::now(),
            kind,
        }
    }

    /// `task-completed`, `task-failed` or `task-cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ProgressKind::TaskCompleted | ProgressKind::TaskFailed { .. } | ProgressKind::TaskCancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            ProgressKind::StageStarted { .. } => "stage-started",
            ProgressKind::Progress { .. } => "progress",
            ProgressKind::StageCompleted { .. } => "stage-completed",
            ProgressKind::RetryScheduled { .. } => "retry-scheduled",
            ProgressKind::TaskCompleted => "task-completed",
            ProgressKind::TaskFailed { .. } => "task-failed",
            ProgressKind::TaskCancelled => "task-cancelled",
        }
    }
}

/// Receiver of progress events. `publish` must return promptly.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Forwards events over a bounded channel; drops when the consumer falls behind.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressEvent>,
    terminal_only: bool,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                terminal_only: false,
            },
            rx,
        )
    }

    /// Only forward terminal events.
    pub fn terminal_only(mut self) -> Self {
        self.terminal_only = true;
        self
    }
}

impl ProgressSink for ChannelSink {
    fn publish(&self, event: ProgressEvent) {
        if self.terminal_only && !event.is_terminal() {
            return;
        }
        if let Err(e) = self.tx.try_send(event) {
            pipeline_metrics().record_dropped_event();
            let (reason, event) = match e {
                mpsc::error::TrySendError::Full(event) => ("full", event),
                mpsc::error::TrySendError::Closed(event) => ("closed", event),
            };
            warn!(
                task_id = %event.task_id,
                event = event.label(),
                reason,
                "Dropped progress event"
            );
        }
    }
}

/// Logs every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn publish(&self, event: ProgressEvent) {
        match &event.kind {
            ProgressKind::Progress {
                stage,
                progress,
                completed,
                total,
            } => info!(
                task_id = %event.task_id,
                stage = %stage,
                progress,
                completed,
                total,
                "progress"
            ),
            ProgressKind::TaskFailed { error } => warn!(
                task_id = %event.task_id,
                stage = %error.stage,
                kind = %error.kind,
                error = %error.message,
                "task-failed"
            ),
            _ => info!(task_id = %event.task_id, event = event.label(), "Progress event"),
        }
    }
}

/// Publishes each event to every inner sink.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ProgressSink for FanoutSink {
    fn publish(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

/// Keeps every event in memory for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn events_for(&self, task_id: &TaskId) -> Vec<ProgressEvent> {
        self.events()
            .into_iter()
            .filter(|event| &event.task_id == task_id)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn publish(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: ProgressKind) -> ProgressEvent {
        ProgressEvent::new(TaskId::from("task-1"), kind)
    }

    #[test]
    fn test_event_serializes_with_kebab_type() {
        let value = serde_json::to_value(event(ProgressKind::TaskCompleted)).unwrap();
        assert_eq!(value["type"], "task-completed");
        assert_eq!(value["task_id"], "task-1");
    }

    #[tokio::test]
    async fn test_channel_sink_never_blocks_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.publish(event(ProgressKind::TaskCompleted));
        sink.publish(event(ProgressKind::TaskCancelled));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, ProgressKind::TaskCompleted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminal_only_filter() {
        let (sink, mut rx) = ChannelSink::new(8);
        let sink = sink.terminal_only();
        sink.publish(event(ProgressKind::StageCompleted {
            stage: "style".to_string(),
            ordinal: 0,
            progress: 0.5,
        }));
        sink.publish(event(ProgressKind::TaskCancelled));
        drop(sink);

        let received: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(received.len(), 1);
        assert!(received[0].is_terminal());
    }

    #[test]
    fn test_fanout_sink_reaches_every_sink() {
        let a = Arc::new(RecordingSink::new());
        let b = Arc::new(RecordingSink::new());
        let fanout = FanoutSink::new().with_sink(a.clone()).with_sink(b.clone());

        fanout.publish(event(ProgressKind::TaskCompleted));
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }
}
