use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "reelflow")]
#[command(about = "Staged task pipeline orchestration with retries, fan-out and progress events")]
#[command(long_about = "Reelflow drives tasks through an ordered pipeline of agent stages, \
                       retrying transient failures with backoff and fanning out independent \
                       sub-units under a concurrency bound. Try 'reelflow demo' to watch a \
                       pipeline run with simulated agents.")]
pub struct Cli {
    /// Extra configuration file layered above reelflow.toml and .reelflow-rc
    #[arg(long, global = true, help = "Path to an additional TOML configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the configured pipeline end-to-end with simulated agents
    Demo {
        /// Number of tasks to submit
        #[arg(long, default_value = "3", help = "Number of tasks to submit and drive concurrently")]
        tasks: usize,
        /// Probability that any agent call fails transiently
        #[arg(long, default_value = "0.1", help = "Transient failure probability per agent call (0.0-1.0)")]
        failure_rate: f64,
        /// Sub-units planned by each fan-out stage
        #[arg(long, default_value = "4", help = "Sub-units per fan-out stage")]
        sub_units: usize,
        /// Use millisecond backoff and agent latency
        #[arg(long, help = "Shrink retry delays and agent latency for a quick run")]
        fast: bool,
    },
    /// Print the task status transition table for the configured pipeline
    Graph,
    /// Show the effective configuration
    Config {
        /// Write the effective configuration to a TOML file
        #[arg(long, help = "Save the effective configuration to this path")]
        save: Option<PathBuf>,
    },
}
