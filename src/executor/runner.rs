//! Suite runner
//!
//! Executes one suite tree sequentially or against a bounded unit pool.
//! Nothing escapes `run`: hook errors, body failures and panics all end up
//! in the shared result.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace};

use super::pool::UnitPool;
use super::strategy::UnitScheduling;
use crate::models::{
    BlockingBody, Category, Forest, RunContext, SuiteChild, SuiteNode, TestBody, TestFailure,
    TestOutcome, TestRef, TestUnit, UnitContext,
};
use crate::utils::Timer;

/// Runs suite trees with one unit scheduling mode
#[derive(Clone, Copy, Debug)]
pub struct SuiteRunner {
    scheduling: UnitScheduling,
}

impl SuiteRunner {
    pub fn new(scheduling: UnitScheduling) -> Self {
        Self { scheduling }
    }

    pub fn sequential() -> Self {
        Self::new(UnitScheduling::Sequential)
    }

    pub fn scheduling(&self) -> UnitScheduling {
        self.scheduling
    }

    /// Run every root in order; all roots share one pool
    pub async fn run_forest(&self, forest: &Forest, ctx: &RunContext) {
        let pool = UnitPool::for_scheduling(self.scheduling);
        for root in forest.roots() {
            if ctx.result.should_stop() {
                debug!("Stop requested; skipping remaining root suites");
                break;
            }
            self.run(root, ctx, pool.as_ref()).await;
        }
    }

    /// Run one suite tree.
    ///
    /// An externally supplied `pool` is passed down to every nested suite.
    /// Without one, a pool is created for this call when the runner's
    /// scheduling asks for it.
    pub async fn run(&self, suite: &Arc<SuiteNode>, ctx: &RunContext, pool: Option<&UnitPool>) {
        let pool = pool
            .cloned()
            .or_else(|| UnitPool::for_scheduling(self.scheduling));
        run_suite(suite.clone(), ctx.clone(), pool).await;
    }
}

fn run_suite(suite: Arc<SuiteNode>, ctx: RunContext, pool: Option<UnitPool>) -> BoxFuture<'static, ()> {
    async move {
        let timer = Timer::start(format!("suite {}", suite.name()));

        let ready = match suite.setup() {
            Some(setup) => match guard_hook(|| setup()) {
                Ok(()) => true,
                Err(message) => {
                    error!("Setup of {} failed: {message}", suite.name());
                    ctx.result.record(
                        Category::Error,
                        TestRef::Suite(suite.clone()),
                        format!("setup failed: {message}"),
                    );
                    false
                }
            },
            None => true,
        };

        if ready {
            match &pool {
                Some(pool) => run_children_pooled(&suite, &ctx, pool).await,
                None => run_children(&suite, &ctx).await,
            }
        }

        if let Some(teardown) = suite.teardown() {
            if let Err(message) = guard_hook(|| teardown()) {
                error!("Teardown of {} failed: {message}", suite.name());
                ctx.result.record(
                    Category::Error,
                    TestRef::Suite(suite.clone()),
                    format!("teardown failed: {message}"),
                );
            }
        }

        timer.stop();
    }
    .boxed()
}

async fn run_children(suite: &Arc<SuiteNode>, ctx: &RunContext) {
    for child in suite.children() {
        if ctx.result.should_stop() {
            debug!("Stop requested; leaving {}", suite.name());
            break;
        }
        match child {
            SuiteChild::Unit(unit) => {
                run_unit(suite.clone(), unit.clone(), ctx.clone(), false).await;
            }
            SuiteChild::Suite(nested) => run_suite(nested.clone(), ctx.clone(), None).await,
        }
    }
}

async fn run_children_pooled(suite: &Arc<SuiteNode>, ctx: &RunContext, pool: &UnitPool) {
    let mut inflight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

    for child in suite.children() {
        if ctx.result.should_stop() {
            debug!("Stop requested; no further dispatch in {}", suite.name());
            break;
        }
        match child {
            SuiteChild::Suite(nested) => {
                inflight.push(run_suite(nested.clone(), ctx.clone(), Some(pool.clone())));
            }
            SuiteChild::Unit(unit) => {
                // Keep nested suites and green units moving while waiting for a slot
                let permit = loop {
                    tokio::select! {
                        biased;
                        permit = pool.acquire() => break permit,
                        Some(()) = inflight.next(), if !inflight.is_empty() => {}
                    }
                };
                if ctx.result.should_stop() {
                    break;
                }
                // Blocking bodies leave the runtime under either pool kind
                let unit = run_unit(suite.clone(), unit.clone(), ctx.clone(), true);
                inflight.push(pool.dispatch(permit, unit));
            }
        }
    }

    while inflight.next().await.is_some() {}
}

/// Hooks, body and outcome of one unit
async fn run_unit(suite: Arc<SuiteNode>, unit: Arc<TestUnit>, ctx: RunContext, offload: bool) {
    if let Err(message) = before_unit(&suite, &unit) {
        error!("Pre-run hook of {} failed for {}: {message}", suite.name(), unit.name());
        ctx.result.record(
            Category::Error,
            TestRef::Suite(suite.clone()),
            format!("pre-run hook failed for {}: {message}", unit.name()),
        );
        return;
    }

    ctx.result.start_test();
    trace!("Running {}", unit.name());

    let unit_ctx = ctx.for_unit(unit.clone());
    let outcome = match unit.body().clone() {
        TestBody::Blocking(body) if offload => {
            match tokio::task::spawn_blocking(move || invoke_blocking(&body, &unit_ctx)).await {
                Ok(outcome) => outcome,
                Err(err) => Err(TestFailure::error(format!("unit thread failed: {err}"))),
            }
        }
        TestBody::Blocking(body) => invoke_blocking(&body, &unit_ctx),
        TestBody::Async(body) => match catch_unwind(AssertUnwindSafe(|| body(unit_ctx))) {
            Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Err(classify_panic(payload)),
            },
            Err(payload) => Err(classify_panic(payload)),
        },
    };

    record_outcome(&ctx, &unit, outcome);
    after_unit(&suite, &unit, &ctx);
}

fn before_unit(suite: &SuiteNode, unit: &TestUnit) -> Result<(), String> {
    suite
        .pre_run_hooks()
        .iter()
        .try_for_each(|hook| guard_hook(|| hook(unit)))
}

fn after_unit(suite: &Arc<SuiteNode>, unit: &TestUnit, ctx: &RunContext) {
    for hook in suite.post_run_hooks() {
        if let Err(message) = guard_hook(|| hook(unit)) {
            error!("Post-run hook of {} failed for {}: {message}", suite.name(), unit.name());
            ctx.result.record(
                Category::Error,
                TestRef::Suite(suite.clone()),
                format!("post-run hook failed for {}: {message}", unit.name()),
            );
        }
    }
}

fn record_outcome(ctx: &RunContext, unit: &Arc<TestUnit>, outcome: TestOutcome) {
    match outcome {
        Ok(()) => trace!("{} passed", unit.name()),
        Err(failure) => {
            debug!("{} {}", unit.name(), failure);
            ctx.result
                .record(failure.category(), TestRef::Unit(unit.clone()), failure.into_message());
        }
    }
}

fn invoke_blocking(body: &Arc<BlockingBody>, ctx: &UnitContext) -> TestOutcome {
    catch_unwind(AssertUnwindSafe(|| body(ctx))).unwrap_or_else(|payload| Err(classify_panic(payload)))
}

/// Run a user callback, turning errors and panics into a message
fn guard_hook<F>(hook: F) -> Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// `assert!`-style panics are failures; anything else is an error
fn classify_panic(payload: Box<dyn Any + Send>) -> TestFailure {
    let message = panic_message(payload.as_ref());
    if message.starts_with("assertion") {
        TestFailure::Assertion(message)
    } else {
        TestFailure::Error(format!("panicked: {message}"))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
