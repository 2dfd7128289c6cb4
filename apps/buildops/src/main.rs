//! buildops - diagnostic driver for the build operation tracker
//!
//! Runs a synthetic build through the tracking core and streams the
//! resulting operation events, or prints the effective configuration.

mod cli;
mod error;
mod events;
mod simulate;

use crate::cli::{Cli, Commands};
use crate::error::CliError;
use crate::simulate::Simulation;
use buildops_config::Config;
use buildops_errors::ConfigError;
use buildops_types::OperationStatus;
use clap::Parser;
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments first to check for JSON mode
    let cli = Cli::parse();
    let json_mode = cli.global.json;

    init_tracing(json_mode, cli.global.debug);

    if let Err(e) = run(cli).await {
        error!("Application error: {}", e);
        if json_mode {
            println!("{}", serde_json::json!({ "error": e.to_string() }));
        } else {
            eprintln!("Error: {e}");
        }
        process::exit(1);
    }
}

/// Main application logic
async fn run(cli: Cli) -> Result<(), CliError> {
    info!("Starting buildops v{}", env!("CARGO_PKG_VERSION"));

    // 1. Start with file config (or defaults)
    let mut config = Config::load_or_default(cli.global.config.as_deref()).await?;

    // 2. Merge environment variables
    config.merge_env()?;

    // 3. Apply CLI flags (highest precedence)
    apply_cli_config(&mut config, &cli.command)?;

    match cli.command {
        Commands::Simulate {
            tasks, fail_every, ..
        } => {
            let simulation = Simulation {
                tasks,
                fail_every,
                trace_events: cli.global.debug,
            };
            let report = simulate::run(&config, simulation, cli.global.json).await?;
            if cli.global.json {
                println!("{}", report.to_json());
            } else {
                println!();
                println!(
                    "build {} ({} tasks, {} events)",
                    report.queue.status,
                    report.queue.total(),
                    report.events
                );
                for (status, count) in &report.finished {
                    println!("  {status:<18} {count}");
                }
            }
            if report.queue.status == OperationStatus::Failed {
                process::exit(2);
            }
        }
        Commands::Config => {
            if cli.global.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config).map_err(buildops_errors::Error::from)?
                );
            } else {
                print!("{}", config.to_toml_string()?);
            }
        }
    }

    info!("Command completed successfully");
    Ok(())
}

/// Apply CLI configuration overrides
fn apply_cli_config(config: &mut Config, command: &Commands) -> Result<(), CliError> {
    if let Commands::Simulate {
        workers,
        fail_every,
        ..
    } = command
    {
        if *fail_every == Some(0) {
            return Err(CliError::InvalidArguments(
                "--fail-every must be at least 1".to_string(),
            ));
        }
        match workers {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    field: "--workers".to_string(),
                    value: "0".to_string(),
                }
                .into())
            }
            Some(workers) => config.queue.max_workers = *workers,
            None => {}
        }
    }
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(json_mode: bool, debug_enabled: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_enabled {
            tracing_subscriber::EnvFilter::new("info,buildops=debug,buildops_operations=debug")
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        }
    });

    if json_mode {
        // JSON mode: logs go to stderr so stdout stays machine readable
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(debug_enabled)
            .with_env_filter(filter)
            .init();
    }
}
