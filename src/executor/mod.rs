//! Test execution engine
//!
//! Strategy selection, suite runners and the run entry point.

mod pool;
mod runner;
mod session;
pub mod strategy;

pub use pool::{PoolKind, UnitPool};
pub use runner::SuiteRunner;
pub use session::{run, Session};
pub use strategy::{ExecutionPlan, Strategy, UnitScheduling};
