//! agentflow command-line entry point.
//!
//! Binary name: `aflow`
//!
//! Parses CLI arguments, sets up tracing and the engine configuration, then
//! dispatches to the flow command handlers.

mod cli;

use std::path::Path;

use clap::Parser;
use clap_complete::generate;

use agentflow_infra::config::{load_engine_config, DEFAULT_CONFIG_FILE};
use agentflow_observe::tracing_setup::{init_tracing, shutdown_tracing, LogFormat, TracingOptions};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,agentflow_core=debug",
        _ => "trace",
    };
    let options = TracingOptions {
        default_filter: filter.to_string(),
        format: if cli.json { LogFormat::Json } else { LogFormat::Pretty },
        enable_otel: cli.otel,
    };
    if let Err(err) = init_tracing(&options) {
        eprintln!("Warning: tracing setup failed: {err}");
    }

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "aflow", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE).to_path_buf());
    let config = load_engine_config(&config_path).await;
    tracing::debug!(?config, path = %config_path.display(), "engine config loaded");

    let result = match cli.command {
        Commands::Validate { file } => cli::flow::handle_validate(&file, cli.json),
        Commands::Plan { file } => cli::flow::handle_plan(&file, cli.json),
        Commands::Run {
            file,
            inputs,
            fields,
            deadline_ms,
            state_db,
        } => {
            let args = cli::flow::RunArgs {
                inputs,
                fields,
                deadline_ms,
                state_db,
            };
            cli::flow::handle_run(&file, args, config, cli.json).await
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    shutdown_tracing();
    result
}
