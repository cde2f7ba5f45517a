//! Data models for suite execution
//!
//! Suite trees, test units, contexts and result accumulation.

mod context;
mod result;
mod suite;

pub use context::{RunContext, UnitContext};
pub use result::{Category, Diagnostic, ResultAccumulator, SharedResult};
pub use suite::{
    Forest, SuiteChild, SuiteHook, SuiteNode, TestBody, TestFailure, TestOutcome, TestRef,
    TestRefView, TestUnit, Ticket, UnitHook,
};

pub(crate) use suite::BlockingBody;
