//! Command line interface definition

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// buildops - drive and inspect the build operation tracker
#[derive(Parser, Debug)]
#[command(name = "buildops")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive a synthetic build through the operation tracker")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Global arguments available for all commands
#[derive(Parser, Debug)]
pub struct GlobalArgs {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    /// Use alternate config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a synthetic build and stream its operation events
    #[command(alias = "sim")]
    Simulate {
        /// Number of task operations under the root build
        #[arg(long, default_value_t = 8)]
        tasks: usize,

        /// Worker threads (overrides queue.max_workers)
        #[arg(long, env = "BUILDOPS_MAX_WORKERS")]
        workers: Option<usize>,

        /// Fail every K-th task, alternating expected and unexpected failures
        #[arg(long, value_name = "K")]
        fail_every: Option<usize>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simulate_flags() {
        let cli = Cli::try_parse_from([
            "buildops",
            "simulate",
            "--tasks",
            "3",
            "--workers",
            "2",
            "--fail-every",
            "2",
            "--json",
        ])
        .unwrap();
        assert!(cli.global.json);
        match cli.command {
            Commands::Simulate {
                tasks,
                workers,
                fail_every,
            } => {
                assert_eq!(tasks, 3);
                assert_eq!(workers, Some(2));
                assert_eq!(fail_every, Some(2));
            }
            Commands::Config => panic!("expected simulate"),
        }
    }

    #[test]
    fn config_takes_global_path() {
        let cli = Cli::try_parse_from(["buildops", "config", "--config", "/tmp/b.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
        assert_eq!(cli.global.config, Some(PathBuf::from("/tmp/b.toml")));
    }
}
