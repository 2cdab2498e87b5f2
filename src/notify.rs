// Webhook notifications for finished tasks
//
// Consumes terminal progress events and POSTs them to a configured URL. Delivery
// uses its own RetryPolicy instance, separate from the pipeline's.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::{ErrorKind, ProgressEvent, ProgressKind, RetryPolicy, TaskError, TaskId};

pub const DEFAULT_WEBHOOK_ATTEMPTS: u32 = 3;
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("webhook rejected notification with status {status}")]
    Rejected { status: u16 },

    #[error("webhook delivery failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Body POSTed for each finished task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub task_id: TaskId,
    pub status: &'static str,
    pub error: Option<TaskError>,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    /// `None` for events that do not finish a task.
    pub fn from_event(event: &ProgressEvent) -> Option<Self> {
        let (status, error) = match &event.kind {
            ProgressKind::TaskCompleted => ("completed", None),
            ProgressKind::TaskFailed { error } => ("failed", Some(error.clone())),
            ProgressKind::TaskCancelled => ("cancelled", None),
            _ => return None,
        };
        Some(Self {
            task_id: event.task_id.clone(),
            status,
            error,
            timestamp: event.at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
    max_attempts: u32,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reelflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            retry: RetryPolicy::default(),
            max_attempts: DEFAULT_WEBHOOK_ATTEMPTS,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver one event. Returns the number of attempts made, 0 for skipped events.
    pub async fn notify(&self, event: &ProgressEvent) -> Result<u32, NotifyError> {
        let Some(payload) = WebhookPayload::from_event(event) else {
            return Ok(0);
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let (kind, failure) = match self.post(&payload).await {
                Ok(()) => {
                    info!(
                        task_id = %payload.task_id,
                        status = payload.status,
                        attempt,
                        "Webhook delivered"
                    );
                    return Ok(attempt);
                }
                Err(failure) => failure,
            };

            let decision = self.retry.should_retry(attempt, self.max_attempts, kind);
            if !decision.retry {
                warn!(task_id = %payload.task_id, attempt, error = %failure, "Webhook delivery failed");
                return Err(match failure {
                    NotifyError::Rejected { .. } if kind == ErrorKind::Permanent => failure,
                    other => NotifyError::Exhausted {
                        attempts: attempt,
                        last_error: other.to_string(),
                    },
                });
            }

            debug!(
                task_id = %payload.task_id,
                attempt,
                delay_ms = decision.delay.as_millis() as u64,
                error = %failure,
                "Retrying webhook delivery"
            );
            tokio::time::sleep(decision.delay).await;
        }
    }

    async fn post(&self, payload: &WebhookPayload) -> Result<(), (ErrorKind, NotifyError)> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| (ErrorKind::Transient, NotifyError::Client(e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let kind = if status.is_server_error() || status.as_u16() == 429 {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        };
        Err((
            kind,
            NotifyError::Rejected {
                status: status.as_u16(),
            },
        ))
    }

    /// Deliver terminal events from `events` until the channel closes or shutdown fires.
    pub async fn run(self, mut events: mpsc::Receiver<ProgressEvent>, shutdown: CancellationToken) {
        info!(url = %self.url, "Webhook notifier started");
        while let Some(Some(event)) = shutdown.run_until_cancelled(events.recv()).await {
            if let Err(e) = self.notify(&event).await {
                error!(task_id = %event.task_id, error = %e, "Dropping webhook notification");
            }
        }
        info!("Webhook notifier stopped");
    }
}
