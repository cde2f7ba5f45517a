//! suite-pool - Concurrent test-suite runner
//!
//! Runs a synthetic forest of test suites under any execution strategy. The
//! binary doubles as its own worker executable for the process strategy.
//!
//! ## Usage
//!
//! ```bash
//! # Run 4 suites on a thread pool of 3
//! suite-pool run --suites 4 --strategy threads --threads 3
//!
//! # One worker process per suite, two at a time, with a failing suite
//! suite-pool run --processes 2 --fail 2
//!
//! # Show which strategy the configuration selects
//! suite-pool plan --green-threads 8
//!
//! # Print the forest with tickets
//! suite-pool tree --suites 2 --units 3
//!
//! # Create a configuration file
//! suite-pool config init
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use suite_pool::cli::{self, Args, ForestArgs, RunArgs};
use suite_pool::config::{print_env_help, ConfigFile, EnvConfig, RunConfig};
use suite_pool::executor::Session;
use suite_pool::models::{Forest, SuiteNode, TestFailure, TestUnit};
use suite_pool::process::worker;
use suite_pool::utils::logger::{init_logger, LogLevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(log_level(&args));

    // A worker rebuilds exactly what the coordinator runs, from the same arguments
    if worker::run_if_requested(|| build_session(&args)).await? {
        return Ok(());
    }

    match &args.command {
        cli::Command::Run(run_args) => {
            let (session, forest) = session_for(&args, run_args)?;
            run_forest(session, forest).await?;
        }
        cli::Command::Plan(run_args) => {
            let config = run_args.apply(RunConfig::resolve(args.config.as_deref())?)?;
            show_plan(&Session::new(config));
        }
        cli::Command::Tree(forest_args) => {
            let forest = demo_forest(forest_args);
            forest.assign_tickets()?;
            print!("{forest}");
        }
        cli::Command::Config(config_args) => {
            manage_config(&config_args.action, args.config.as_deref())?;
        }
    }

    Ok(())
}

/// Level from `-v`, else the config file, else `SUITE_POOL_LOG`
fn log_level(args: &Args) -> LogLevel {
    if args.verbose > 0 {
        return LogLevel::from_verbosity(args.verbose);
    }
    let from_file = match &args.config {
        Some(path) => ConfigFile::load(path).ok(),
        None => ConfigFile::load_default().ok(),
    }
    .and_then(|file| file.log_level());

    from_file
        .or_else(|| EnvConfig::load().log.as_deref().and_then(LogLevel::from_str))
        .unwrap_or(LogLevel::Info)
}

fn build_session(args: &Args) -> Result<(Session, Forest)> {
    match &args.command {
        cli::Command::Run(run_args) => session_for(args, run_args),
        _ => anyhow::bail!("Only the run command can start workers"),
    }
}

fn session_for(args: &Args, run_args: &RunArgs) -> Result<(Session, Forest)> {
    let config = run_args.apply(RunConfig::resolve(args.config.as_deref())?)?;
    let mut session = Session::new(config);
    session
        .extensions_mut()
        .register_eager("label", format!("{} suites", run_args.forest.suites))
        .context("Failed to register the label extension")?;
    Ok((session, demo_forest(&run_args.forest)))
}

/// Synthetic forest: `suites` roots of `units` sleeping units each
fn demo_forest(args: &ForestArgs) -> Forest {
    let delay = Duration::from_millis(args.unit_ms);

    Forest::new((1..=args.suites).map(|s| {
        let mut suite = SuiteNode::new(format!("suite-{s}"));
        for u in 1..=args.units {
            let failing = args.fail == Some(s) && u == args.units;
            suite = suite.unit(
                TestUnit::new(format!("unit-{s}.{u}"), move |ctx| {
                    let label: String = ctx.extension("label")?;
                    std::thread::sleep(delay);
                    TestFailure::ensure(!failing, format!("{} failed on purpose ({label})", ctx.unit().name()))
                })
                .require(["label"]),
            );
        }
        suite
    }))
}

async fn run_forest(session: Session, forest: Forest) -> Result<()> {
    println!("\nsuite-pool: {} suites, {} units", forest.len(), forest.unit_count());
    println!("Plan: {}\n", session.plan());

    let result = session.run(&forest).await.context("Run aborted")?;
    print!("{result}");

    if !result.was_successful() {
        info!("Run finished with problems");
        std::process::exit(1);
    }
    Ok(())
}

fn show_plan(session: &Session) {
    let config = session.config();
    println!("\nExecution Plan");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  {}", session.plan());
    println!(
        "  strategy={} processes={} threads={} green_threads={}",
        config
            .strategy
            .map_or_else(|| "(by pool size)".to_string(), |s| s.to_string()),
        config.processes,
        config.threads,
        config.green_threads
    );
    println!(
        "  release_timeout={}s poll_interval={}ms fail_fast={}",
        config.release_timeout_secs, config.poll_interval_ms, config.fail_fast
    );
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
}

fn manage_config(action: &cli::ConfigAction, explicit: Option<&Path>) -> Result<()> {
    match action {
        cli::ConfigAction::Init { output, force } => {
            let path = Path::new(output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }
            ConfigFile::default().save(path)?;
            println!("✓ Configuration file created: {output}");
        }

        cli::ConfigAction::Show { env, format } => {
            if *env {
                EnvConfig::load().print_summary();
            } else {
                let config = ConfigFile::new(RunConfig::resolve(explicit)?);
                let output = if format == "json" {
                    serde_json::to_string_pretty(&config)?
                } else {
                    serde_yaml::to_string(&config)?
                };
                println!("{output}");
            }
        }

        cli::ConfigAction::Validate { file } => {
            let path = file
                .clone()
                .or_else(|| ConfigFile::find().map(|p| p.to_string_lossy().to_string()))
                .unwrap_or_else(|| "./suite-pool.yaml".to_string());

            match ConfigFile::load(&path) {
                Ok(_) => println!("✓ Configuration file is valid: {path}"),
                Err(e) => {
                    println!("✗ Configuration file is invalid: {path}");
                    println!("  Error: {e}");
                    return Err(e);
                }
            }
        }

        cli::ConfigAction::EnvHelp => print_env_help(),
    }

    Ok(())
}
