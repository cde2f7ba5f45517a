//! Result accumulation
//!
//! Counts and diagnostics produced by a run, plus the lock-guarded wrapper
//! that concurrent units record into.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::suite::TestRef;

/// Diagnostic category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Failure,
    Error,
    Skip,
}

impl Category {
    pub fn symbol(&self) -> &'static str {
        match self {
            Category::Failure => "✗",
            Category::Error => "!",
            Category::Skip => "○",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Failure => write!(f, "FAIL"),
            Category::Error => write!(f, "ERROR"),
            Category::Skip => write!(f, "SKIP"),
        }
    }
}

/// One recorded problem and the node it is about
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub test: TestRef,
    pub message: String,
}

impl Diagnostic {
    pub fn new(test: TestRef, message: impl Into<String>) -> Self {
        Self {
            test,
            message: message.into(),
        }
    }
}

/// Aggregate outcome of a run
#[derive(Clone, Debug, Default)]
pub struct ResultAccumulator {
    pub run: usize,
    pub failures: Vec<Diagnostic>,
    pub errors: Vec<Diagnostic>,
    pub skipped: Vec<Diagnostic>,
    pub should_stop: bool,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a unit whose body is about to run
    pub fn start_test(&mut self) {
        self.run += 1;
    }

    pub fn add(&mut self, category: Category, test: TestRef, message: impl Into<String>) {
        let diagnostic = Diagnostic::new(test, message);
        match category {
            Category::Failure => self.failures.push(diagnostic),
            Category::Error => self.errors.push(diagnostic),
            Category::Skip => self.skipped.push(diagnostic),
        }
    }

    pub fn add_failure(&mut self, test: TestRef, message: impl Into<String>) {
        self.add(Category::Failure, test, message);
    }

    pub fn add_error(&mut self, test: TestRef, message: impl Into<String>) {
        self.add(Category::Error, test, message);
    }

    pub fn add_skip(&mut self, test: TestRef, message: impl Into<String>) {
        self.add(Category::Skip, test, message);
    }

    pub fn stop(&mut self) {
        self.should_stop = true;
    }

    /// Fold another accumulator in; entries keep their node identity
    pub fn merge(&mut self, other: ResultAccumulator) {
        self.run += other.run;
        self.failures.extend(other.failures);
        self.errors.extend(other.errors);
        self.skipped.extend(other.skipped);
        self.should_stop |= other.should_stop;
    }

    pub fn entries(&self, category: Category) -> &[Diagnostic] {
        match category {
            Category::Failure => &self.failures,
            Category::Error => &self.errors,
            Category::Skip => &self.skipped,
        }
    }

    /// All diagnostics with their category
    pub fn diagnostics(&self) -> impl Iterator<Item = (Category, &Diagnostic)> {
        [Category::Failure, Category::Error, Category::Skip]
            .into_iter()
            .flat_map(move |category| self.entries(category).iter().map(move |d| (category, d)))
    }

    pub fn was_successful(&self) -> bool {
        self.failures.is_empty() && self.errors.is_empty()
    }

    /// Units that ran without any unit-level diagnostic
    pub fn passed(&self) -> usize {
        let unit_problems = self.diagnostics().filter(|(_, d)| d.test.is_unit()).count();
        self.run.saturating_sub(unit_problems)
    }

    pub fn has_problems(&self) -> bool {
        !self.was_successful() || !self.skipped.is_empty()
    }
}

impl fmt::Display for ResultAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_problems() {
            writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
            for (category, diagnostic) in self.diagnostics() {
                writeln!(
                    f,
                    "  {} {} {}: {}",
                    category.symbol(),
                    category,
                    diagnostic.test,
                    diagnostic.message
                )?;
            }
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Run: {} | Pass: {} | Fail: {} | Error: {} | Skip: {}",
            self.run,
            self.passed(),
            self.failures.len(),
            self.errors.len(),
            self.skipped.len()
        )?;
        if self.should_stop {
            writeln!(f, "Stopped early (fail-fast)")?;
        }
        Ok(())
    }
}

/// Accumulator shared by everything executing within one run
#[derive(Debug, Default)]
pub struct SharedResult {
    inner: Mutex<ResultAccumulator>,
    stop: AtomicBool,
    fail_fast: bool,
}

impl SharedResult {
    pub fn new(fail_fast: bool) -> Self {
        Self {
            inner: Mutex::new(ResultAccumulator::new()),
            stop: AtomicBool::new(false),
            fail_fast,
        }
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn start_test(&self) {
        self.lock().start_test();
    }

    pub fn record(&self, category: Category, test: TestRef, message: impl Into<String>) {
        self.lock().add(category, test, message);
        if self.fail_fast && category != Category::Skip {
            self.request_stop();
        }
    }

    pub fn merge(&self, other: ResultAccumulator) {
        let halt = other.should_stop || (self.fail_fast && !other.was_successful());
        self.lock().merge(other);
        if halt {
            self.request_stop();
        }
    }

    /// Polled before every dispatch; never interrupts running units
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ResultAccumulator {
        let mut accumulator = self.lock().clone();
        accumulator.should_stop = self.should_stop();
        accumulator
    }

    /// Move the collected results out, leaving an empty accumulator behind
    pub fn take(&self) -> ResultAccumulator {
        let mut accumulator = std::mem::take(&mut *self.lock());
        accumulator.should_stop = self.should_stop();
        accumulator
    }

    fn lock(&self) -> MutexGuard<'_, ResultAccumulator> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
