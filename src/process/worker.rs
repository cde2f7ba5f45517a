//! Worker process entry
//!
//! A worker is the same executable started again with `WORKER_ENV` set. It
//! rebuilds the forest and extensions exactly as the coordinator did, runs
//! the one suite it was given and prints its report.

use anyhow::{Context, Result};
use chrono::Utc;
use std::io::{self, Write};
use tracing::debug;

use super::channel::WorkerReport;
use super::launcher::WorkerSpec;
use crate::executor::Session;
use crate::models::Forest;

/// Act as a worker if this process was started as one.
///
/// Call this first thing in `main` (or in the test that re-executes
/// itself). Returns `Ok(false)` in a normal process. In a worker, `build`
/// must produce the same forest the coordinator runs.
pub async fn run_if_requested<F>(build: F) -> Result<bool>
where
    F: FnOnce() -> Result<(Session, Forest)>,
{
    let Some(spec) = WorkerSpec::from_env() else {
        return Ok(false);
    };
    let spec = spec?;
    debug!("Worker for task {} starting", spec.task);

    let (session, forest) = build().context("Failed to rebuild suites in worker")?;
    let report = run_worker(session, &forest, &spec).await?;
    emit(&report)?;
    Ok(true)
}

/// Run the suite named by `spec` and build its report
pub async fn run_worker(session: Session, forest: &Forest, spec: &WorkerSpec) -> Result<WorkerReport> {
    let started_at = Utc::now();
    let accumulator = session
        .run_suite_range(forest, spec.first_ticket, spec.end_ticket)
        .await
        .with_context(|| format!("Worker for task {} failed", spec.task))?;
    Ok(WorkerReport::from_accumulator(spec.first_ticket, &accumulator, started_at)?)
}

fn emit(report: &WorkerReport) -> Result<()> {
    let line = report.encode().context("Failed to encode worker report")?;
    let mut stdout = io::stdout().lock();
    // Leading newline: the report must start its own line
    writeln!(stdout)?;
    writeln!(stdout, "{line}")?;
    stdout.flush().context("Failed to flush worker report")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::models::{Category, SuiteNode, TestFailure, TestUnit, Ticket};

    #[tokio::test]
    async fn test_run_worker_reports_tickets() {
        let forest = Forest::new(vec![
            SuiteNode::new("a").unit(TestUnit::new("a1", |_| Ok(()))),
            SuiteNode::new("b")
                .unit(TestUnit::new("b1", |_| Ok(())))
                .unit(TestUnit::new("b2", |_| Err(TestFailure::skip("later")))),
        ]);
        let spec = WorkerSpec {
            task: 1,
            first_ticket: Ticket(3),
            end_ticket: 6,
        };

        let report = run_worker(Session::new(RunConfig::default()), &forest, &spec)
            .await
            .unwrap();

        assert_eq!(report.first_ticket, Ticket(3));
        assert_eq!(report.run, 2);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].ticket, Ticket(5));
        assert_eq!(report.entries[0].category, Category::Skip);
        assert!(report.finished_at >= report.started_at);
    }

    #[tokio::test]
    async fn test_not_a_worker_without_env() {
        // the coordinator's own test process never carries the worker variable
        let ran = tokio_test::assert_ok!(run_if_requested(|| anyhow::bail!("must not be called")).await);
        assert!(!ran);
    }
}
