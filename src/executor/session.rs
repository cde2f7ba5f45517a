//! Run session
//!
//! Owns the configuration and extension registry for one run and drives the
//! forest through whichever strategy the configuration selects.

use std::fmt;
use std::sync::Arc;
use tracing::info;

use super::runner::SuiteRunner;
use super::strategy::{self, ExecutionPlan, Strategy};
use crate::config::RunConfig;
use crate::error::{ReconciliationError, RunError};
use crate::extensions::{ExtensionRegistry, RegistryScope};
use crate::models::{Forest, ResultAccumulator, RunContext, SharedResult, Ticket};
use crate::process::{CommandLauncher, PoolConfig, ProcessPool, WorkerLauncher};
use crate::utils::Timer;

/// Configuration, extensions and worker launcher for one run
pub struct Session {
    config: RunConfig,
    extensions: ExtensionRegistry,
    launcher: Option<Arc<dyn WorkerLauncher>>,
}

impl Session {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            extensions: ExtensionRegistry::new(),
            launcher: None,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Registry to populate before the run starts
    pub fn extensions_mut(&mut self) -> &mut ExtensionRegistry {
        &mut self.extensions
    }

    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Self {
        self.extensions = extensions;
        self
    }

    /// Launcher for worker processes; defaults to re-running this executable
    pub fn with_launcher(mut self, launcher: impl WorkerLauncher + 'static) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    pub fn plan(&self) -> ExecutionPlan {
        strategy::select_for_host(&self.config)
    }

    /// Run the whole forest and return the merged result.
    ///
    /// Fails only on conditions fatal to the run: a missing extension, a
    /// stuck process pool, an interrupt, or worker output that cannot be
    /// reconciled. Tickets are assigned here, so a forest runs once.
    pub async fn run(self, forest: &Forest) -> Result<ResultAccumulator, RunError> {
        let plan = self.plan();
        let Session {
            config,
            extensions,
            launcher,
        } = self;

        extensions.validate(&forest.requirements())?;
        let tickets = forest.assign_tickets()?;

        info!(
            "Running {} suites ({} units, {} tickets) with {}",
            forest.len(),
            forest.unit_count(),
            tickets,
            plan
        );
        let timer = Timer::start("run");

        let scope = RegistryScope::new(extensions);
        let result = Arc::new(SharedResult::new(config.fail_fast));

        match plan.strategy {
            Strategy::Processes { workers } => {
                let launcher = match launcher {
                    Some(launcher) => launcher,
                    None => Arc::new(CommandLauncher::current().map_err(RunError::Worker)?),
                };
                let mut pool = ProcessPool::new(
                    PoolConfig::from_run_config(&config, workers),
                    launcher,
                    result.clone(),
                );
                for root in forest.roots() {
                    pool.add_task(root.clone());
                }
                pool.serve().await?;
            }
            _ => {
                let ctx = RunContext::new(scope.registry(), result.clone());
                SuiteRunner::new(plan.units).run_forest(forest, &ctx).await;
            }
        }
        drop(scope);

        let accumulator = result.take();
        info!(
            "Run finished in {}ms: {} run, {} failures, {} errors, {} skipped",
            timer.elapsed_ms(),
            accumulator.run,
            accumulator.failures.len(),
            accumulator.errors.len(),
            accumulator.skipped.len()
        );
        Ok(accumulator)
    }

    /// Run the one suite of `forest` owning tickets `first..end`, as a worker
    pub(crate) async fn run_suite_range(
        self,
        forest: &Forest,
        first: Ticket,
        end: u64,
    ) -> Result<ResultAccumulator, RunError> {
        let plan = self.plan();
        let Session {
            config, extensions, ..
        } = self;

        extensions.validate(&forest.requirements())?;
        forest.assign_tickets()?;

        let suite = forest
            .find_suite(first)
            .filter(|suite| suite.ticket_range() == Some(first.0..end))
            .ok_or(ReconciliationError::ForestMismatch {
                start: first.0,
                end,
            })?;

        let scope = RegistryScope::new(extensions);
        let result = Arc::new(SharedResult::new(config.fail_fast));
        let ctx = RunContext::new(scope.registry(), result.clone());

        info!("Worker running {} with units {}", suite.name(), plan.units);
        SuiteRunner::new(plan.units).run(&suite, &ctx, None).await;

        drop(ctx);
        drop(scope);
        Ok(result.take())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("extensions", &self.extensions)
            .field("custom_launcher", &self.launcher.is_some())
            .finish()
    }
}

/// Run `forest` under `config` with an empty extension registry
pub async fn run(forest: &Forest, config: RunConfig) -> Result<ResultAccumulator, RunError> {
    Session::new(config).run(forest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyName;
    use crate::extensions::ExtensionError;
    use crate::models::{SuiteNode, TestFailure, TestUnit};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Ledger {
        entries: Mutex<Vec<String>>,
    }

    fn ledger_forest(suites: usize, units: usize) -> Forest {
        Forest::new((0..suites).map(|s| {
            let mut suite = SuiteNode::new(format!("suite {s}"));
            for u in 0..units {
                suite = suite.unit(
                    TestUnit::new(format!("unit {s}.{u}"), |ctx| {
                        let ledger: Arc<Ledger> = ctx.extension("ledger")?;
                        ledger.entries.lock().unwrap().push(ctx.unit().name().to_string());
                        let count = ledger.entries.lock().unwrap().len();
                        TestFailure::ensure(count == 1, "ledger shared")
                    })
                    .require(["ledger"]),
                );
            }
            suite
        }))
    }

    #[tokio::test]
    async fn test_every_in_process_strategy_isolates_lazy_extensions() {
        for strategy in [StrategyName::Sequential, StrategyName::Green, StrategyName::Threads] {
            let constructed = Arc::new(AtomicUsize::new(0));
            let counter = constructed.clone();

            let mut session = Session::new(RunConfig::default().with_strategy(strategy));
            session.extensions_mut().register_lazy("ledger", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(Ledger::default())
            });

            let forest = ledger_forest(2, 3);
            let result = session.run(&forest).await.unwrap();

            assert_eq!(result.run, 6, "{strategy}");
            assert!(result.was_successful(), "{strategy}: {result}");
            assert_eq!(constructed.load(Ordering::SeqCst), 6);
        }
    }

    #[tokio::test]
    async fn test_missing_extension_fails_before_running() {
        let forest = ledger_forest(1, 1);
        let err = run(&forest, RunConfig::default()).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Extension(ExtensionError::NotFound(ref name)) if name == "ledger"
        ));
        assert_eq!(forest.roots()[0].ticket(), None);
    }

    #[tokio::test]
    async fn test_undeclared_extension_is_an_error() {
        let mut session = Session::new(RunConfig::default());
        session.extensions_mut().register_eager("secret", 7_u32).unwrap();

        let forest = Forest::new(vec![SuiteNode::new("s").unit(TestUnit::new("nosy", |ctx| {
            let _: u32 = ctx.extension("secret")?;
            Ok(())
        }))]);
        let result = session.run(&forest).await.unwrap();

        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("not required"));
    }

    #[tokio::test]
    async fn test_forest_runs_once() {
        let forest = Forest::new(vec![SuiteNode::new("s").unit(TestUnit::new("u", |_| Ok(())))]);
        run(&forest, RunConfig::default()).await.unwrap();

        let err = run(&forest, RunConfig::default()).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Reconciliation(ReconciliationError::AlreadyTicketed { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_range_must_match_a_suite() {
        let forest = ledger_forest(2, 1);
        let mut session = Session::new(RunConfig::default());
        session.extensions_mut().register_lazy("ledger", || Arc::new(Ledger::default()));

        let err = session.run_suite_range(&forest, Ticket(1), 99).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Reconciliation(ReconciliationError::ForestMismatch { start: 1, end: 99 })
        ));
    }

    #[tokio::test]
    async fn test_worker_runs_only_its_suite() {
        let forest = ledger_forest(2, 2);
        let mut session = Session::new(RunConfig::default());
        session.extensions_mut().register_lazy("ledger", || Arc::new(Ledger::default()));

        let result = session.run_suite_range(&forest, Ticket(4), 7).await.unwrap();
        assert_eq!(result.run, 2);
        assert!(result.was_successful());
    }
}
