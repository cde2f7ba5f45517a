//! Process strategy end to end
//!
//! Each test re-executes this test binary, filtered to itself, as the worker
//! processes. The first thing every test does is check whether it is running
//! as a worker.

use std::sync::Arc;

use suite_pool::config::{RunConfig, StrategyName};
use suite_pool::executor::Session;
use suite_pool::models::{Forest, SharedResult, SuiteChild, SuiteNode, TestFailure, TestUnit};
use suite_pool::process::{worker, CommandLauncher, PoolConfig, ProcessPool};

fn self_launcher(test: &str) -> CommandLauncher {
    CommandLauncher::current_exe()
        .unwrap()
        .args([test, "--exact", "--nocapture", "--test-threads=1", "--quiet"])
}

/// 3 suites of 2 units; the second unit of suite-2 fails its assertion
fn forest() -> Forest {
    Forest::new((1..=3).map(|s| {
        SuiteNode::new(format!("suite-{s}"))
            .unit(TestUnit::new(format!("unit-{s}.1"), |ctx| {
                let offset: i64 = ctx.extension("offset")?;
                TestFailure::ensure(offset + 1 == 42, "offset is wired")
            })
            .require(["offset"]))
            .unit(TestUnit::new(format!("unit-{s}.2"), move |_| {
                assert_ne!(s, 2, "suite-2 is broken");
                Ok(())
            }))
    }))
}

fn session(config: RunConfig) -> Session {
    let mut session = Session::new(config);
    session.extensions_mut().register_eager("offset", 41_i64).unwrap();
    session
}

fn unit(forest: &Forest, suite: usize, index: usize) -> Arc<TestUnit> {
    match &forest.roots()[suite].children()[index] {
        SuiteChild::Unit(unit) => unit.clone(),
        SuiteChild::Suite(_) => panic!("expected a unit"),
    }
}

#[tokio::test]
async fn process_strategy_reconciles_onto_original_units() {
    let config = RunConfig::default().with_processes(2);
    if worker::run_if_requested(|| Ok((session(config.clone()), forest())))
        .await
        .unwrap()
    {
        return;
    }

    let forest = forest();
    let session = session(config).with_launcher(self_launcher("process_strategy_reconciles_onto_original_units"));
    assert_eq!(session.plan().strategy, suite_pool::executor::Strategy::Processes { workers: 2 });

    let result = session.run(&forest).await.unwrap();

    assert_eq!(result.run, 6, "{result}");
    assert_eq!(result.failures.len(), 1, "{result}");
    assert!(result.errors.is_empty(), "{result}");
    assert!(result.failures[0].message.starts_with("assertion"));
    assert!(result.failures[0].test.is_unit_object(&unit(&forest, 1, 1)));
}

#[tokio::test]
async fn pool_reports_match_master_total() {
    if worker::run_if_requested(|| Ok((session(RunConfig::default()), forest())))
        .await
        .unwrap()
    {
        return;
    }

    let forest = forest();
    forest.assign_tickets().unwrap();
    let result = Arc::new(SharedResult::new(false));
    let mut pool = ProcessPool::new(
        PoolConfig::new(2),
        Arc::new(self_launcher("pool_reports_match_master_total")),
        result.clone(),
    );
    for root in forest.roots() {
        pool.add_task(root.clone());
    }

    let stats = pool.serve().await.unwrap();
    let merged = result.take();

    assert_eq!(stats.started, 3);
    assert!(stats.peak_active <= 2);
    assert_eq!(pool.reported_runs(), merged.run);
    assert_eq!(merged.run, 6);
}

#[tokio::test]
async fn crashed_worker_is_an_error_on_its_suite() {
    let build = || {
        Forest::new(vec![
            SuiteNode::new("steady").unit(TestUnit::new("fine", |_| Ok(()))),
            SuiteNode::new("doomed").unit(TestUnit::new("exits", |_| std::process::exit(3))),
        ])
    };
    let config = RunConfig::default().with_strategy(StrategyName::Processes);
    if worker::run_if_requested(|| Ok((Session::new(config.clone()), build())))
        .await
        .unwrap()
    {
        return;
    }

    let forest = build();
    let result = Session::new(config)
        .with_launcher(self_launcher("crashed_worker_is_an_error_on_its_suite"))
        .run(&forest)
        .await
        .unwrap();

    assert_eq!(result.run, 1, "{result}");
    assert_eq!(result.errors.len(), 1, "{result}");
    let error = &result.errors[0];
    assert!(error.test.is_suite_object(&forest.roots()[1]));
    assert!(error.message.contains("before reporting"), "{}", error.message);
}
