use anyhow::{bail, Result};
use reelflow::config::{StoreBackend, StoreConfig};
use reelflow::pipeline::{
    ChannelSink, FanoutSink, InMemoryTaskStore, JsonFileTaskStore, ProgressEvent, ProgressKind,
    ProgressSink, TaskStore, TracingSink,
};
use reelflow::{
    simulated_registry, Orchestrator, ReelflowConfig, RetryPolicy, RunOutcome, ShutdownCoordinator,
    TaskDriver, WebhookNotifier,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::Command;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct DemoCommand {
    config: ReelflowConfig,
    tasks: usize,
    failure_rate: f64,
    sub_units: usize,
    fast: bool,
}

/// Prints each progress event as a one-line status update.
struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn publish(&self, event: ProgressEvent) {
        let task: String = event.task_id.as_str().chars().take(8).collect();
        match &event.kind {
            ProgressKind::StageStarted { stage, attempt, .. } => {
                println!("  ▶️  [{task}] {stage} started (attempt {attempt})")
            }
            // Single-unit stages are covered by their completion line.
            ProgressKind::Progress { total: 1, .. } => {}
            ProgressKind::Progress {
                stage,
                completed,
                total,
                ..
            } => println!("  ⏳ [{task}] {stage} {completed}/{total} sub-units settled"),
            ProgressKind::StageCompleted {
                stage, progress, ..
            } => println!("  ✅ [{task}] {stage} done ({:.0}%)", progress * 100.0),
            ProgressKind::RetryScheduled {
                stage,
                attempt,
                delay_ms,
            } => println!("  🔁 [{task}] {stage} failed, retry #{attempt} in {delay_ms}ms"),
            ProgressKind::TaskCompleted => println!("  🎉 [{task}] completed"),
            ProgressKind::TaskFailed { error } => {
                println!("  ❌ [{task}] failed at {}: {}", error.stage, error.message)
            }
            ProgressKind::TaskCancelled => println!("  🛑 [{task}] cancelled"),
        }
    }
}

impl DemoCommand {
    pub fn new(
        config: ReelflowConfig,
        tasks: usize,
        failure_rate: f64,
        sub_units: usize,
        fast: bool,
    ) -> Self {
        Self {
            config,
            tasks,
            failure_rate,
            sub_units,
            fast,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        if self.fast {
            RetryPolicy::new(Duration::from_millis(50), Duration::from_millis(400), true)
        } else {
            self.config.retry_policy()
        }
    }

    fn latency(&self) -> Duration {
        if self.fast {
            Duration::from_millis(5)
        } else {
            Duration::from_millis(200)
        }
    }
}

pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn TaskStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryTaskStore::new())),
        StoreBackend::File => Ok(Arc::new(JsonFileTaskStore::open(&config.path).await?)),
        #[cfg(feature = "database")]
        StoreBackend::Sqlite => Ok(Arc::new(
            reelflow::database::SqliteTaskStore::connect(&config.path).await?,
        )),
        #[cfg(not(feature = "database"))]
        StoreBackend::Sqlite => {
            bail!("store backend 'sqlite' requires building with --features database")
        }
    }
}

impl Command for DemoCommand {
    async fn execute(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            bail!("--failure-rate must be between 0.0 and 1.0");
        }

        let pipeline = self.config.to_pipeline()?;
        println!(
            "🎬 Running {} task(s) through {} stages (failure rate {:.0}%)",
            self.tasks,
            pipeline.len(),
            self.failure_rate * 100.0
        );
        println!();

        let coordinator = ShutdownCoordinator::new();
        coordinator.install_signal_handlers()?;

        let mut sink = FanoutSink::new()
            .with_sink(Arc::new(TracingSink))
            .with_sink(Arc::new(ConsoleSink));

        let notifier_stop = CancellationToken::new();
        let mut notifier = None;
        if let Some(url) = &self.config.webhook.url {
            let (channel, events) = ChannelSink::new(self.config.events.channel_capacity);
            sink = sink.with_sink(Arc::new(channel.terminal_only()));
            let webhook = WebhookNotifier::new(
                url.clone(),
                Duration::from_secs(self.config.webhook.timeout_seconds),
            )?
            .with_max_attempts(self.config.webhook.max_attempts);
            println!("🔔 Webhook notifications → {}", webhook.url());
            notifier = Some(tokio::spawn(webhook.run(events, notifier_stop.clone())));
        }

        let store = open_store(&self.config.store).await?;
        let registry = simulated_registry(&pipeline, self.failure_rate, self.latency(), self.sub_units);
        let orchestrator = Arc::new(
            Orchestrator::builder(pipeline, registry, store)
                .with_sink(Arc::new(sink))
                .with_retry_policy(self.retry_policy())
                .with_max_retries(self.config.retry.max_retries)
                .with_shutdown(coordinator.token())
                .build()?,
        );
        let driver = TaskDriver::new(orchestrator.clone());

        let mut handles = Vec::with_capacity(self.tasks);
        for i in 0..self.tasks {
            let task_id = orchestrator
                .submit(json!({ "prompt": format!("demo video #{}", i + 1) }))
                .await?;
            if let Some(handle) = driver.spawn(task_id.clone()) {
                handles.push((task_id, handle));
            }
        }

        let mut completed = 0;
        let mut failed = 0;
        let mut interrupted = 0;
        for (task_id, handle) in handles {
            match handle.await? {
                Ok(RunOutcome::Completed) => completed += 1,
                Ok(RunOutcome::Failed(_)) => failed += 1,
                Ok(_) => interrupted += 1,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Task run aborted");
                    failed += 1;
                }
            }
        }

        println!();
        println!("📊 DEMO SUMMARY");
        println!("===============");
        println!("  🎉 Completed:   {completed}");
        println!("  ❌ Failed:      {failed}");
        println!("  ⏸️  Interrupted: {interrupted}");

        coordinator
            .shutdown_all_services(&orchestrator, SHUTDOWN_GRACE)
            .await;
        if self.config.observability.metrics_enabled {
            let stats = reelflow::pipeline_metrics().get_stats();
            println!("  🔁 Retries scheduled: {}", stats.retries_scheduled);
            println!("  🧩 Sub-units ok/failed: {}/{}", stats.sub_units_succeeded, stats.sub_units_failed);
        }

        // Closing the last sender lets the notifier drain queued terminal events.
        drop(driver);
        drop(orchestrator);
        if let Some(handle) = notifier {
            let budget = Duration::from_secs(
                self.config.webhook.timeout_seconds * u64::from(self.config.webhook.max_attempts),
            );
            if tokio::time::timeout(budget, handle).await.is_err() {
                warn!("Webhook notifier did not drain in time");
                notifier_stop.cancel();
            }
        }

        Ok(())
    }
}
