//! Suite tree models
//!
//! Defines suites, test units, and the tickets that identify them across
//! process boundaries.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use super::context::UnitContext;
use super::result::Category;
use crate::error::ReconciliationError;
use crate::extensions::{Capabilities, ExtensionError};

/// Run-unique identity of a suite or unit, assigned at dispatch time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a test body did not pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestFailure {
    /// An expectation did not hold
    Assertion(String),
    /// Anything else went wrong
    Error(String),
    /// The body decided not to run
    Skipped(String),
}

/// Result of one test body
pub type TestOutcome = Result<(), TestFailure>;

impl TestFailure {
    pub fn assertion(message: impl Into<String>) -> Self {
        TestFailure::Assertion(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        TestFailure::Error(message.into())
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        TestFailure::Skipped(reason.into())
    }

    /// Fail with an assertion unless `condition` holds
    pub fn ensure(condition: bool, message: impl Into<String>) -> TestOutcome {
        if condition {
            Ok(())
        } else {
            Err(TestFailure::assertion(message))
        }
    }

    pub fn category(&self) -> Category {
        match self {
            TestFailure::Assertion(_) => Category::Failure,
            TestFailure::Error(_) => Category::Error,
            TestFailure::Skipped(_) => Category::Skip,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            TestFailure::Assertion(m) | TestFailure::Error(m) | TestFailure::Skipped(m) => m,
        }
    }

    pub fn into_message(self) -> String {
        match self {
            TestFailure::Assertion(m) | TestFailure::Error(m) | TestFailure::Skipped(m) => m,
        }
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category(), self.message())
    }
}

impl From<anyhow::Error> for TestFailure {
    fn from(err: anyhow::Error) -> Self {
        TestFailure::Error(format!("{err:#}"))
    }
}

impl From<ExtensionError> for TestFailure {
    fn from(err: ExtensionError) -> Self {
        TestFailure::Error(err.to_string())
    }
}

pub(crate) type BlockingBody = dyn Fn(&UnitContext) -> TestOutcome + Send + Sync;
pub(crate) type AsyncBody = dyn Fn(UnitContext) -> BoxFuture<'static, TestOutcome> + Send + Sync;

/// Callable part of a test unit
#[derive(Clone)]
pub enum TestBody {
    /// Runs to completion on whichever thread executes it
    Blocking(Arc<BlockingBody>),
    /// Suspends at await points; green pools interleave these
    Async(Arc<AsyncBody>),
}

/// One schedulable test invocation
pub struct TestUnit {
    name: String,
    requires: Capabilities,
    body: TestBody,
    ticket: OnceLock<Ticket>,
}

impl TestUnit {
    /// Create a unit with a blocking body
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&UnitContext) -> TestOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            requires: Capabilities::new(),
            body: TestBody::Blocking(Arc::new(body)),
            ticket: OnceLock::new(),
        }
    }

    /// Create a unit with an async body
    pub fn new_async<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestOutcome> + Send + 'static,
    {
        let body = move |ctx: UnitContext| -> BoxFuture<'static, TestOutcome> { Box::pin(body(ctx)) };
        Self {
            name: name.into(),
            requires: Capabilities::new(),
            body: TestBody::Async(Arc::new(body)),
            ticket: OnceLock::new(),
        }
    }

    /// Declare extensions this unit may ask for
    pub fn require<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.requires.insert(name);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requires(&self) -> &Capabilities {
        &self.requires
    }

    pub fn body(&self) -> &TestBody {
        &self.body
    }

    pub fn ticket(&self) -> Option<Ticket> {
        self.ticket.get().copied()
    }

    fn assign_ticket(&self, ticket: Ticket) -> Result<(), ReconciliationError> {
        assign_once(&self.ticket, ticket, &self.name)
    }
}

impl fmt::Debug for TestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestUnit")
            .field("name", &self.name)
            .field("ticket", &self.ticket())
            .field("requires", &self.requires)
            .finish()
    }
}

/// Suite-level setup or teardown callback
pub type SuiteHook = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Callback run before or after each unit of a suite
pub type UnitHook = Arc<dyn Fn(&TestUnit) -> anyhow::Result<()> + Send + Sync>;

/// Element of a suite
#[derive(Clone, Debug)]
pub enum SuiteChild {
    Unit(Arc<TestUnit>),
    Suite(Arc<SuiteNode>),
}

/// Ordered container of units and nested suites
pub struct SuiteNode {
    name: String,
    children: Vec<SuiteChild>,
    setup: Option<SuiteHook>,
    teardown: Option<SuiteHook>,
    pre_run: Vec<UnitHook>,
    post_run: Vec<UnitHook>,
    ticket: OnceLock<Ticket>,
}

impl SuiteNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            setup: None,
            teardown: None,
            pre_run: Vec::new(),
            post_run: Vec::new(),
            ticket: OnceLock::new(),
        }
    }

    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(setup));
        self
    }

    pub fn with_teardown<F>(mut self, teardown: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.teardown = Some(Arc::new(teardown));
        self
    }

    /// Add a hook run before every unit of this suite
    pub fn pre_run<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestUnit) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.pre_run.push(Arc::new(hook));
        self
    }

    /// Add a hook run after every unit of this suite
    pub fn post_run<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestUnit) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.post_run.push(Arc::new(hook));
        self
    }

    pub fn unit(self, unit: TestUnit) -> Self {
        self.shared_unit(Arc::new(unit))
    }

    /// Add a unit the caller keeps a handle to
    pub fn shared_unit(mut self, unit: Arc<TestUnit>) -> Self {
        self.children.push(SuiteChild::Unit(unit));
        self
    }

    pub fn suite(self, suite: SuiteNode) -> Self {
        self.shared_suite(Arc::new(suite))
    }

    pub fn shared_suite(mut self, suite: Arc<SuiteNode>) -> Self {
        self.children.push(SuiteChild::Suite(suite));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[SuiteChild] {
        &self.children
    }

    pub fn setup(&self) -> Option<&SuiteHook> {
        self.setup.as_ref()
    }

    pub fn teardown(&self) -> Option<&SuiteHook> {
        self.teardown.as_ref()
    }

    pub fn pre_run_hooks(&self) -> &[UnitHook] {
        &self.pre_run
    }

    pub fn post_run_hooks(&self) -> &[UnitHook] {
        &self.post_run
    }

    pub fn ticket(&self) -> Option<Ticket> {
        self.ticket.get().copied()
    }

    /// Tickets owned by this subtree; contiguous because assignment is pre-order
    pub fn ticket_range(&self) -> Option<Range<u64>> {
        let first = self.ticket()?.0;
        let mut last = first;
        self.walk(&mut |node| {
            if let Some(ticket) = node.ticket() {
                last = last.max(ticket.0);
            }
        });
        Some(first..last + 1)
    }

    /// Number of units in this subtree
    pub fn unit_count(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                SuiteChild::Unit(_) => 1,
                SuiteChild::Suite(suite) => suite.unit_count(),
            })
            .sum()
    }

    /// Union of every capability declared below this suite
    pub fn requirements(&self) -> Capabilities {
        let mut capabilities = Capabilities::new();
        self.walk(&mut |node| {
            if let TestRefView::Unit(unit) = node {
                capabilities.extend(unit.requires());
            }
        });
        capabilities
    }

    /// Find the suite holding `ticket` in this subtree
    pub fn find_suite(self: &Arc<Self>, ticket: Ticket) -> Option<Arc<SuiteNode>> {
        if self.ticket() == Some(ticket) {
            return Some(self.clone());
        }
        self.children.iter().find_map(|child| match child {
            SuiteChild::Suite(suite) => suite.find_suite(ticket),
            SuiteChild::Unit(_) => None,
        })
    }

    /// Visit this suite and everything below it in pre-order
    pub fn walk(&self, visit: &mut dyn FnMut(TestRefView<'_>)) {
        visit(TestRefView::Suite(self));
        for child in &self.children {
            match child {
                SuiteChild::Unit(unit) => visit(TestRefView::Unit(unit)),
                SuiteChild::Suite(suite) => suite.walk(visit),
            }
        }
    }

    /// Like `walk`, handing out owned references
    pub fn walk_refs(self: &Arc<Self>, visit: &mut dyn FnMut(TestRef)) {
        visit(TestRef::Suite(self.clone()));
        for child in &self.children {
            match child {
                SuiteChild::Unit(unit) => visit(TestRef::Unit(unit.clone())),
                SuiteChild::Suite(suite) => suite.walk_refs(visit),
            }
        }
    }

    fn assign_tickets(&self, next: &mut u64) -> Result<(), ReconciliationError> {
        assign_once(&self.ticket, Ticket(*next), &self.name)?;
        *next += 1;
        for child in &self.children {
            match child {
                SuiteChild::Unit(unit) => {
                    unit.assign_ticket(Ticket(*next))?;
                    *next += 1;
                }
                SuiteChild::Suite(suite) => suite.assign_tickets(next)?,
            }
        }
        Ok(())
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        writeln!(f, "{indent}{} {}", self.name, display_ticket(self.ticket()))?;
        for child in &self.children {
            match child {
                SuiteChild::Unit(unit) => {
                    writeln!(f, "{indent}  - {} {}", unit.name(), display_ticket(unit.ticket()))?
                }
                SuiteChild::Suite(suite) => suite.fmt_tree(f, depth + 1)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SuiteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteNode")
            .field("name", &self.name)
            .field("ticket", &self.ticket())
            .field("children", &self.children.len())
            .finish()
    }
}

/// Borrowed view of a node, handed out while walking a tree
#[derive(Clone, Copy, Debug)]
pub enum TestRefView<'a> {
    Suite(&'a SuiteNode),
    Unit(&'a Arc<TestUnit>),
}

impl TestRefView<'_> {
    pub fn ticket(&self) -> Option<Ticket> {
        match self {
            TestRefView::Suite(suite) => suite.ticket(),
            TestRefView::Unit(unit) => unit.ticket(),
        }
    }
}

/// Owned handle to the node a diagnostic is about
#[derive(Clone)]
pub enum TestRef {
    Suite(Arc<SuiteNode>),
    Unit(Arc<TestUnit>),
}

impl TestRef {
    pub fn name(&self) -> &str {
        match self {
            TestRef::Suite(suite) => suite.name(),
            TestRef::Unit(unit) => unit.name(),
        }
    }

    pub fn ticket(&self) -> Option<Ticket> {
        match self {
            TestRef::Suite(suite) => suite.ticket(),
            TestRef::Unit(unit) => unit.ticket(),
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, TestRef::Unit(_))
    }

    /// Identity comparison; two distinct nodes never match
    pub fn same_as(&self, other: &TestRef) -> bool {
        match (self, other) {
            (TestRef::Suite(a), TestRef::Suite(b)) => Arc::ptr_eq(a, b),
            (TestRef::Unit(a), TestRef::Unit(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn is_unit_object(&self, unit: &Arc<TestUnit>) -> bool {
        matches!(self, TestRef::Unit(own) if Arc::ptr_eq(own, unit))
    }

    pub fn is_suite_object(&self, suite: &Arc<SuiteNode>) -> bool {
        matches!(self, TestRef::Suite(own) if Arc::ptr_eq(own, suite))
    }
}

impl fmt::Debug for TestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestRef::Suite(_) => write!(f, "Suite({} {})", self.name(), display_ticket(self.ticket())),
            TestRef::Unit(_) => write!(f, "Unit({} {})", self.name(), display_ticket(self.ticket())),
        }
    }
}

impl fmt::Display for TestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered collection of root suites handed over for one run
#[derive(Clone, Default)]
pub struct Forest {
    roots: Vec<Arc<SuiteNode>>,
}

impl Forest {
    pub fn new(roots: impl IntoIterator<Item = SuiteNode>) -> Self {
        Self {
            roots: roots.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_shared(roots: Vec<Arc<SuiteNode>>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[Arc<SuiteNode>] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn unit_count(&self) -> usize {
        self.roots.iter().map(|root| root.unit_count()).sum()
    }

    /// Number every suite and unit in pre-order, starting at 1.
    ///
    /// Identical forests always receive identical tickets, which is what lets
    /// a worker process rebuild the forest and speak about the same nodes.
    /// Returns the number of tickets handed out.
    pub fn assign_tickets(&self) -> Result<u64, ReconciliationError> {
        let mut next = 1;
        for root in &self.roots {
            root.assign_tickets(&mut next)?;
        }
        Ok(next - 1)
    }

    pub fn requirements(&self) -> Capabilities {
        let mut capabilities = Capabilities::new();
        for root in &self.roots {
            capabilities.extend(&root.requirements());
        }
        capabilities
    }

    pub fn find_suite(&self, ticket: Ticket) -> Option<Arc<SuiteNode>> {
        self.roots.iter().find_map(|root| root.find_suite(ticket))
    }
}

impl fmt::Display for Forest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for root in &self.roots {
            root.fmt_tree(f, 0)?;
        }
        Ok(())
    }
}

fn assign_once(slot: &OnceLock<Ticket>, ticket: Ticket, name: &str) -> Result<(), ReconciliationError> {
    slot.set(ticket).map_err(|_| ReconciliationError::AlreadyTicketed {
        name: name.to_string(),
        ticket: slot.get().copied().unwrap_or(ticket),
    })
}

fn display_ticket(ticket: Option<Ticket>) -> String {
    ticket.map_or_else(|| "(unticketed)".to_string(), |t| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing(name: &str) -> TestUnit {
        TestUnit::new(name, |_| Ok(()))
    }

    fn sample_forest() -> Forest {
        Forest::new(vec![
            SuiteNode::new("alpha")
                .unit(passing("a1"))
                .suite(SuiteNode::new("alpha.inner").unit(passing("a2")))
                .unit(passing("a3")),
            SuiteNode::new("beta").unit(passing("b1")),
        ])
    }

    #[test]
    fn test_tickets_are_preorder() {
        let forest = sample_forest();
        assert_eq!(forest.assign_tickets().unwrap(), 7);

        let alpha = &forest.roots()[0];
        assert_eq!(alpha.ticket(), Some(Ticket(1)));
        assert_eq!(alpha.ticket_range(), Some(1..6));

        let beta = &forest.roots()[1];
        assert_eq!(beta.ticket(), Some(Ticket(6)));
        assert_eq!(beta.ticket_range(), Some(6..8));
    }

    #[test]
    fn test_rebuilt_forest_gets_same_tickets() {
        let first = sample_forest();
        let second = sample_forest();
        first.assign_tickets().unwrap();
        second.assign_tickets().unwrap();

        let inner_first = first.find_suite(Ticket(3)).unwrap();
        let inner_second = second.find_suite(Ticket(3)).unwrap();
        assert_eq!(inner_first.name(), "alpha.inner");
        assert_eq!(inner_first.name(), inner_second.name());
        assert_eq!(inner_first.ticket_range(), inner_second.ticket_range());
    }

    #[test]
    fn test_shared_unit_cannot_be_ticketed_twice() {
        let unit = Arc::new(passing("twice"));
        let forest = Forest::new(vec![SuiteNode::new("s")
            .shared_unit(unit.clone())
            .shared_unit(unit)]);

        let err = forest.assign_tickets().unwrap_err();
        assert!(matches!(err, ReconciliationError::AlreadyTicketed { .. }));
    }

    #[test]
    fn test_requirements_union() {
        let forest = Forest::new(vec![SuiteNode::new("s")
            .unit(passing("a").require(["db"]))
            .suite(SuiteNode::new("n").unit(passing("b").require(["cache", "db"])))]);

        let required = forest.requirements();
        assert!(required.allows("db"));
        assert!(required.allows("cache"));
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn test_unit_count_and_tree() {
        let forest = sample_forest();
        forest.assign_tickets().unwrap();
        assert_eq!(forest.unit_count(), 4);

        let tree = forest.to_string();
        assert!(tree.contains("alpha #1"));
        assert!(tree.contains("  - a2 #4"));
    }

    #[test]
    fn test_ref_identity() {
        let unit = Arc::new(passing("u"));
        let same = TestRef::Unit(unit.clone());
        let other = TestRef::Unit(Arc::new(passing("u")));

        assert!(same.same_as(&TestRef::Unit(unit.clone())));
        assert!(!same.same_as(&other));
        assert!(same.is_unit_object(&unit));
    }

    #[test]
    fn test_failure_categories() {
        assert_eq!(TestFailure::assertion("x").category(), Category::Failure);
        assert_eq!(TestFailure::error("x").category(), Category::Error);
        assert_eq!(TestFailure::skip("x").category(), Category::Skip);
        assert!(TestFailure::ensure(true, "fine").is_ok());

        let converted: TestFailure = anyhow::anyhow!("boom").into();
        assert_eq!(converted, TestFailure::Error("boom".to_string()));
    }
}
