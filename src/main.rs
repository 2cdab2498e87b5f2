use anyhow::Result;
use clap::Parser;

mod cli;

use cli::commands::{
    config::ConfigCommand, demo::DemoCommand, graph::GraphCommand, show_how_to_get_started,
    Command,
};
use cli::{Cli, Commands};
use reelflow::{init_telemetry, shutdown_telemetry, ReelflowConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    ReelflowConfig::load_env_file()?;
    let config = ReelflowConfig::load_from(cli.config.as_deref())?;
    init_telemetry(
        &config.observability.log_level,
        config.observability.json_logs,
    )?;

    let result = match cli.command {
        // Default behavior: no subcommand - explain how to get started
        None => tokio::runtime::Runtime::new()?.block_on(async { show_how_to_get_started().await }),
        Some(Commands::Demo {
            tasks,
            failure_rate,
            sub_units,
            fast,
        }) => tokio::runtime::Runtime::new()?.block_on(async {
            DemoCommand::new(config, tasks, failure_rate, sub_units, fast)
                .execute()
                .await
        }),
        Some(Commands::Graph) => tokio::runtime::Runtime::new()?.block_on(async {
            GraphCommand::new(&config)?.execute().await
        }),
        Some(Commands::Config { save }) => tokio::runtime::Runtime::new()?.block_on(async {
            ConfigCommand::new(config, save).execute().await
        }),
    };

    shutdown_telemetry();
    result
}
