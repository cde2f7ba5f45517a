//! suite-pool: concurrent test-suite execution
//!
//! Runs a forest of test suites sequentially, on a bounded green or thread
//! pool, or with each root suite in its own worker process. Results from
//! every strategy land in one `ResultAccumulator` whose entries refer to the
//! original test objects.
//!
//! ## Usage
//!
//! ```no_run
//! use suite_pool::config::{RunConfig, StrategyName};
//! use suite_pool::executor::Session;
//! use suite_pool::models::{Forest, SuiteNode, TestFailure, TestUnit};
//!
//! # async fn demo() -> Result<(), suite_pool::error::RunError> {
//! let forest = Forest::new(vec![SuiteNode::new("math")
//!     .unit(TestUnit::new("adds", |_| TestFailure::ensure(1 + 1 == 2, "1 + 1")))]);
//!
//! let session = Session::new(RunConfig::default().with_strategy(StrategyName::Threads));
//! let result = session.run(&forest).await?;
//! assert!(result.was_successful());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod extensions;
pub mod models;
pub mod process;
pub mod utils;
