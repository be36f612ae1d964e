//! mcp-hangar - control plane for MCP tool providers

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcp_hangar::{cli::Cli, config::Config, runtime::Runtime, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if cli.no_watch {
                config.workers.watch_config = false;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        providers = config.providers.len(),
        groups = config.groups.len(),
        "Starting mcp-hangar"
    );

    let runtime = match Runtime::build(config, cli.config.clone()) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to build runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.start().await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }

    runtime.shutdown().await;
    info!("Shutdown complete");
    ExitCode::SUCCESS
}
