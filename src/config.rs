use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::{
    FailureTolerance, OrchestratorError, Pipeline, RetryPolicy, StageDescriptor,
    DEFAULT_MAX_RETRIES,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Pipeline(#[from] OrchestratorError),
}

/// Main configuration structure for Reelflow
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReelflowConfig {
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
    pub webhook: WebhookConfig,
    pub observability: ObservabilityConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Backoff after the first failed attempt
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Stage attempts per task before it fails for good
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub fan_out: bool,
    /// Sub-units in flight at once (fan-out stages only)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_sub_unit_attempts")]
    pub sub_unit_attempts: u32,
    #[serde(default)]
    pub tolerance: FailureTolerance,
    /// Share of overall progress
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_concurrency() -> usize {
    1
}

fn default_sub_unit_attempts() -> u32 {
    crate::pipeline::types::DEFAULT_SUB_UNIT_ATTEMPTS
}

fn default_weight() -> f64 {
    1.0
}

impl StageConfig {
    fn single(name: &str, weight: f64) -> Self {
        Self {
            name: name.to_string(),
            fan_out: false,
            concurrency: default_concurrency(),
            sub_unit_attempts: default_sub_unit_attempts(),
            tolerance: FailureTolerance::Strict,
            weight,
        }
    }

    fn fan_out(name: &str, concurrency: usize, weight: f64) -> Self {
        Self {
            fan_out: true,
            concurrency,
            ..Self::single(name, weight)
        }
    }

    pub fn to_descriptor(&self) -> StageDescriptor {
        let descriptor = if self.fan_out {
            StageDescriptor::fan_out(&self.name, self.concurrency)
                .with_tolerance(self.tolerance)
                .with_sub_unit_attempts(self.sub_unit_attempts)
        } else {
            StageDescriptor::single(&self.name)
        };
        descriptor.with_weight(self.weight)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Directory for `file`, database URL or path for `sqlite`
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Notifications are disabled when unset
    pub url: Option<String>,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output
    pub json_logs: bool,
    /// Log pipeline counters on shutdown
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EventsConfig {
    /// Buffer of the progress event channel before events are dropped
    pub channel_capacity: usize,
}

impl Default for ReelflowConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                jitter: true,
                max_retries: DEFAULT_MAX_RETRIES,
            },
            pipeline: PipelineConfig {
                stages: vec![
                    StageConfig::single("style_detection", 15.0),
                    StageConfig::single("story_generation", 15.0),
                    StageConfig::single("storyboard_breakdown", 15.0),
                    StageConfig::fan_out("image_generation", 3, 25.0),
                    StageConfig::fan_out("video_generation", 2, 10.0),
                    StageConfig::single("composing", 10.0),
                ],
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                path: ".reelflow/tasks".to_string(),
            },
            webhook: WebhookConfig {
                url: None,
                timeout_seconds: 10,
                max_attempts: 3,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: false,
                metrics_enabled: true,
            },
            events: EventsConfig {
                channel_capacity: 256,
            },
        }
    }
}

impl ReelflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (reelflow.toml, .reelflow-rc)
    /// 3. Environment variables (prefixed with REELFLOW_, nested keys split by `__`)
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like `load`, with an extra file layered above the default files.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("reelflow.toml").exists() {
            builder = builder.add_source(File::with_name("reelflow"));
        }

        if Path::new(".reelflow-rc").exists() {
            builder = builder.add_source(File::with_name(".reelflow-rc").format(config::FileFormat::Toml));
        }

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("REELFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: ReelflowConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.webhook.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "webhook.max_attempts must be at least 1".to_string(),
            ));
        }
        self.to_pipeline().map(|_| ())
    }

    pub fn to_pipeline(&self) -> Result<Pipeline, ConfigError> {
        let stages = self
            .pipeline
            .stages
            .iter()
            .map(StageConfig::to_descriptor)
            .collect();
        Ok(Pipeline::new(stages)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.jitter,
        )
    }
}
