//! Worker launching
//!
//! A worker is told which suite to run through `WORKER_ENV`; the launcher
//! only decides what program to start.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::error::ReconciliationError;
use crate::models::{SuiteNode, Ticket};

/// Environment variable carrying a `WorkerSpec` into a worker process
pub const WORKER_ENV: &str = "SUITE_POOL_WORKER";

/// What a worker must run: the suite owning tickets `first_ticket..end_ticket`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub task: usize,
    pub first_ticket: Ticket,
    pub end_ticket: u64,
}

impl WorkerSpec {
    pub fn for_suite(task: usize, suite: &SuiteNode) -> Result<Self, ReconciliationError> {
        let range = suite
            .ticket_range()
            .ok_or_else(|| ReconciliationError::Unticketed {
                name: suite.name().to_string(),
            })?;
        Ok(Self {
            task,
            first_ticket: Ticket(range.start),
            end_ticket: range.end,
        })
    }

    pub fn to_env(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Spec of the current process, if it was started as a worker
    pub fn from_env() -> Option<anyhow::Result<Self>> {
        let raw = env::var(WORKER_ENV).ok()?;
        Some(serde_json::from_str(&raw).with_context(|| format!("Invalid {WORKER_ENV} value: {raw}")))
    }
}

/// Builds the command that becomes a worker process
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, spec: &WorkerSpec) -> Command;
}

impl<F> WorkerLauncher for F
where
    F: Fn(&WorkerSpec) -> Command + Send + Sync,
{
    fn command(&self, spec: &WorkerSpec) -> Command {
        self(spec)
    }
}

/// Starts a fixed program with fixed arguments
#[derive(Clone, Debug)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-run this executable with the arguments it was started with
    pub fn current() -> io::Result<Self> {
        Ok(Self::current_exe()?.args(env::args_os().skip(1)))
    }

    /// Re-run this executable without arguments
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerLauncher for CommandLauncher {
    fn command(&self, _spec: &WorkerSpec) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Forest, TestUnit};

    #[test]
    fn test_spec_covers_suite_range() {
        let forest = Forest::new(vec![
            SuiteNode::new("first").unit(TestUnit::new("a", |_| Ok(()))),
            SuiteNode::new("second")
                .unit(TestUnit::new("b", |_| Ok(())))
                .unit(TestUnit::new("c", |_| Ok(()))),
        ]);
        forest.assign_tickets().unwrap();

        let spec = WorkerSpec::for_suite(1, &forest.roots()[1]).unwrap();
        assert_eq!(
            spec,
            WorkerSpec {
                task: 1,
                first_ticket: Ticket(3),
                end_ticket: 6,
            }
        );

        let decoded: WorkerSpec = serde_json::from_str(&spec.to_env().unwrap()).unwrap();
        assert_eq!(decoded, spec);
    }

    #[test]
    fn test_unticketed_suite_is_rejected() {
        let err = WorkerSpec::for_suite(0, &SuiteNode::new("loose")).unwrap_err();
        assert!(matches!(err, ReconciliationError::Unticketed { .. }));
    }

    #[test]
    fn test_command_launcher_arguments() {
        let launcher = CommandLauncher::new("/usr/bin/env").arg("--quiet").args(["a", "b"]);
        assert_eq!(launcher.program(), Path::new("/usr/bin/env"));

        let command = launcher.command(&WorkerSpec {
            task: 0,
            first_ticket: Ticket(1),
            end_ticket: 2,
        });
        let args: Vec<_> = command.as_std().get_args().collect();
        assert_eq!(args, ["--quiet", "a", "b"]);
    }
}
