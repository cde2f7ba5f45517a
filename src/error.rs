//! Run-level errors
//!
//! Everything a test body or hook does is recorded into the result
//! accumulator. Only the conditions below abort a run.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::extensions::ExtensionError;
use crate::models::Ticket;

/// Failure to map worker output back onto the in-memory forest
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("Worker for task {task} reported unknown ticket {ticket}")]
    UnknownTicket { ticket: Ticket, task: usize },

    #[error("Ticket {ticket} reported by task {task} belongs to task {owner}")]
    ForeignTicket {
        ticket: Ticket,
        task: usize,
        owner: usize,
    },

    #[error("Ticket {ticket} was assigned twice")]
    DuplicateTicket { ticket: Ticket },

    #[error("{name} already holds ticket {ticket}")]
    AlreadyTicketed { name: String, ticket: Ticket },

    #[error("{name} has no ticket; tickets must be assigned before dispatch")]
    Unticketed { name: String },

    #[error("Task {task} reported twice")]
    DuplicateReport { task: usize },

    #[error("Worker forest has no suite owning tickets {start}..{end}")]
    ForestMismatch { start: u64, end: u64 },
}

/// Fatal run conditions
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Process list has not been released for {waited:?} ({active} workers still running)")]
    Timeout { waited: Duration, active: usize },

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error("Run interrupted")]
    Interrupted,

    #[error("Failed to start worker for task {task}: {source}")]
    Spawn {
        task: usize,
        #[source]
        source: io::Error,
    },

    #[error("Worker process error: {0}")]
    Worker(#[source] io::Error),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error("Failed to encode worker message: {0}")]
    Report(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_duration() {
        let err = RunError::Timeout {
            waited: Duration::from_secs(3),
            active: 2,
        };
        let message = err.to_string();
        assert!(message.contains("3s"));
        assert!(message.contains("2 workers"));
    }

    #[test]
    fn test_reconciliation_converts() {
        let err: RunError = ReconciliationError::UnknownTicket {
            ticket: Ticket(9),
            task: 1,
        }
        .into();
        assert!(matches!(err, RunError::Reconciliation(_)));
        assert_eq!(err.to_string(), "Worker for task 1 reported unknown ticket #9");
    }
}
