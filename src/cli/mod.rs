//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{RunConfig, StrategyName};

/// Concurrent test-suite runner
#[derive(Parser, Debug)]
#[command(name = "suite-pool")]
#[command(version = "0.1.0")]
#[command(about = "Run test suites sequentially, on thread or green pools, or in worker processes")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file to use instead of the standard locations
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a synthetic suite forest
    Run(RunArgs),

    /// Show the execution plan the configuration selects
    Plan(RunArgs),

    /// Print the suite forest with its tickets
    Tree(ForestArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Shape of the synthetic forest
#[derive(Parser, Debug, Clone)]
pub struct ForestArgs {
    /// Number of root suites
    #[arg(short, long, default_value = "3")]
    pub suites: usize,

    /// Units per suite
    #[arg(short, long, default_value = "2")]
    pub units: usize,

    /// Make the last unit of this suite (1-based) fail its assertion
    #[arg(long)]
    pub fail: Option<usize>,

    /// Milliseconds each unit sleeps
    #[arg(long, default_value = "10")]
    pub unit_ms: u64,
}

/// Arguments for run and plan commands
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub forest: ForestArgs,

    /// Strategy (sequential, green, threads, processes)
    #[arg(long)]
    pub strategy: Option<String>,

    /// Worker processes
    #[arg(short, long)]
    pub processes: Option<usize>,

    /// Thread pool size
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Green pool size
    #[arg(short, long)]
    pub green_threads: Option<usize>,

    /// Seconds to wait for a free worker slot
    #[arg(long)]
    pub release_timeout: Option<u64>,

    /// Stop after the first failure or error
    #[arg(long)]
    pub fail_fast: bool,
}

impl RunArgs {
    /// Layer command-line flags over a resolved configuration
    pub fn apply(&self, mut config: RunConfig) -> Result<RunConfig> {
        if let Some(strategy) = &self.strategy {
            config = config.with_strategy(strategy.parse::<StrategyName>()?);
        }
        if let Some(processes) = self.processes {
            config = config.with_processes(processes);
        }
        if let Some(threads) = self.threads {
            config = config.with_threads(threads);
        }
        if let Some(green_threads) = self.green_threads {
            config = config.with_green_threads(green_threads);
        }
        if let Some(secs) = self.release_timeout {
            config = config.with_release_timeout(secs);
        }
        if self.fail_fast {
            config = config.with_fail_fast(true);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Arguments for config management
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a configuration file with default settings
    Init {
        /// Output file path
        #[arg(short, long, default_value = "./suite-pool.yaml")]
        output: String,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Show environment overrides instead
        #[arg(short, long)]
        env: bool,

        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        file: Option<String>,
    },

    /// List the environment variables that override configuration
    EnvHelp,
}
