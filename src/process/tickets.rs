//! Ticket reconciliation
//!
//! Maps tickets reported by workers back onto the coordinator's own suite
//! and unit objects. Unknown or misattributed tickets are errors, never
//! dropped.

use std::collections::HashMap;
use std::sync::Arc;

use super::channel::WorkerReport;
use crate::error::ReconciliationError;
use crate::models::{ResultAccumulator, SuiteNode, TestRef, Ticket};

#[derive(Clone, Debug)]
struct Owned {
    node: TestRef,
    task: usize,
}

/// Ticket to node lookup, built once before dispatch
#[derive(Debug, Default)]
pub struct TicketMap {
    nodes: HashMap<Ticket, Owned>,
}

impl TicketMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every node of `suite` as owned by `task`
    pub fn register_task(&mut self, task: usize, suite: &Arc<SuiteNode>) -> Result<(), ReconciliationError> {
        let mut outcome = Ok(());
        suite.walk_refs(&mut |node| {
            if outcome.is_err() {
                return;
            }
            outcome = self.insert(task, node);
        });
        outcome
    }

    fn insert(&mut self, task: usize, node: TestRef) -> Result<(), ReconciliationError> {
        let ticket = node.ticket().ok_or_else(|| ReconciliationError::Unticketed {
            name: node.name().to_string(),
        })?;
        if self.nodes.contains_key(&ticket) {
            return Err(ReconciliationError::DuplicateTicket { ticket });
        }
        self.nodes.insert(ticket, Owned { node, task });
        Ok(())
    }

    /// The original node behind `ticket`, as reported by `task`
    pub fn resolve(&self, task: usize, ticket: Ticket) -> Result<TestRef, ReconciliationError> {
        let owned = self
            .nodes
            .get(&ticket)
            .ok_or(ReconciliationError::UnknownTicket { ticket, task })?;
        if owned.task != task {
            return Err(ReconciliationError::ForeignTicket {
                ticket,
                task,
                owner: owned.task,
            });
        }
        Ok(owned.node.clone())
    }

    /// Rebuild a worker's accumulator against the original objects
    pub fn reconcile(&self, task: usize, report: &WorkerReport) -> Result<ResultAccumulator, ReconciliationError> {
        self.resolve(task, report.first_ticket)?;

        let mut accumulator = ResultAccumulator::new();
        accumulator.run = report.run;
        for entry in &report.entries {
            let node = self.resolve(task, entry.ticket)?;
            accumulator.add(entry.category, node, entry.message.clone());
        }
        if report.should_stop {
            accumulator.stop();
        }
        Ok(accumulator)
    }

    pub fn owner(&self, ticket: Ticket) -> Option<usize> {
        self.nodes.get(&ticket).map(|owned| owned.task)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
