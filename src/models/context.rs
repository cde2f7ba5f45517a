//! Execution contexts
//!
//! `RunContext` is what a runner carries through a suite tree;
//! `UnitContext` is what a single test body sees.

use std::any::Any;
use std::sync::Arc;

use super::result::SharedResult;
use super::suite::TestUnit;
use crate::extensions::{ExtensionError, ExtensionRegistry};

/// State shared by everything executing within one run
#[derive(Clone, Debug)]
pub struct RunContext {
    pub extensions: Arc<ExtensionRegistry>,
    pub result: Arc<SharedResult>,
}

impl RunContext {
    pub fn new(extensions: Arc<ExtensionRegistry>, result: Arc<SharedResult>) -> Self {
        Self { extensions, result }
    }

    pub(crate) fn for_unit(&self, unit: Arc<TestUnit>) -> UnitContext {
        UnitContext {
            unit,
            extensions: self.extensions.clone(),
            result: self.result.clone(),
        }
    }
}

/// Handle given to a test body
#[derive(Clone)]
pub struct UnitContext {
    unit: Arc<TestUnit>,
    extensions: Arc<ExtensionRegistry>,
    result: Arc<SharedResult>,
}

impl UnitContext {
    pub fn unit(&self) -> &TestUnit {
        &self.unit
    }

    /// Fetch an independent instance of a declared extension
    pub fn extension<T: Any>(&self, name: &str) -> Result<T, ExtensionError> {
        self.extensions.get(name, self.unit.requires())
    }

    /// Raise the run-wide stop flag; units already running are not interrupted
    pub fn stop_run(&self) {
        self.result.request_stop();
    }

    pub fn should_stop(&self) -> bool {
        self.result.should_stop()
    }
}
