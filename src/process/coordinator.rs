//! Process pool coordinator
//!
//! Runs each queued suite in its own worker process with at most
//! `max_processes` alive at once. Finished workers are reaped by polling;
//! a pool that stays full for `release_timeout` is treated as stuck and
//! every worker is terminated.

use std::collections::VecDeque;
use std::future::{self, Future};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::channel::{ChannelMessage, ResultChannel, ResultSender};
use super::launcher::{WorkerLauncher, WorkerSpec, WORKER_ENV};
use super::tickets::TicketMap;
use crate::config::RunConfig;
use crate::error::{ReconciliationError, RunError};
use crate::models::{Category, SharedResult, SuiteNode, TestRef};
use crate::utils::Timer;

/// Pool limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_processes: usize,
    pub release_timeout: Duration,
    /// How often finished workers are looked for while waiting
    pub poll_interval: Duration,
}

impl PoolConfig {
    pub fn new(max_processes: usize) -> Self {
        Self {
            max_processes: max_processes.max(1),
            release_timeout: Duration::from_secs(crate::config::DEFAULT_RELEASE_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(crate::config::DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn from_run_config(config: &RunConfig, workers: usize) -> Self {
        Self {
            release_timeout: config.release_timeout(),
            poll_interval: config.poll_interval(),
            ..Self::new(workers)
        }
    }

    pub fn with_release_timeout(mut self, release_timeout: Duration) -> Self {
        self.release_timeout = release_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Counters describing one `serve`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub started: usize,
    /// Workers reaped after exiting on their own
    pub reclaimed: usize,
    /// Workers killed by `terminate_all`
    pub terminated: usize,
    pub peak_active: usize,
}

/// A suite waiting for a worker, with the channel its worker reports into
#[derive(Debug)]
pub struct WorkerTask {
    index: usize,
    suite: Arc<SuiteNode>,
    channel: ResultSender,
}

impl WorkerTask {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn suite(&self) -> &Arc<SuiteNode> {
        &self.suite
    }
}

/// One occupied slot
#[derive(Debug)]
pub struct PoolSlot {
    child: Child,
    started_at: Instant,
    task: usize,
}

#[derive(Debug)]
struct TaskRecord {
    suite: Arc<SuiteNode>,
    started: bool,
    exit: Option<ExitStatus>,
    reported_run: Option<usize>,
    /// Unreadable report lines, kept until a valid report supersedes them
    malformed: Vec<String>,
}

impl TaskRecord {
    fn has_reported(&self) -> bool {
        self.reported_run.is_some()
    }
}

/// Bounded launcher of worker processes
pub struct ProcessPool {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    queue: VecDeque<WorkerTask>,
    active: Vec<PoolSlot>,
    tickets: TicketMap,
    channel: ResultChannel,
    tasks: Vec<TaskRecord>,
    result: Arc<SharedResult>,
    stats: PoolStats,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn WorkerLauncher>, result: Arc<SharedResult>) -> Self {
        Self {
            config,
            launcher,
            queue: VecDeque::new(),
            active: Vec::new(),
            tickets: TicketMap::new(),
            channel: ResultChannel::new(),
            tasks: Vec::new(),
            result,
            stats: PoolStats::default(),
        }
    }

    /// Queue a ticketed suite; nothing starts until `serve`
    pub fn add_task(&mut self, suite: Arc<SuiteNode>) -> usize {
        let index = self.tasks.len();
        let channel = self.channel.sender(index);
        self.tasks.push(TaskRecord {
            suite: suite.clone(),
            started: false,
            exit: None,
            reported_run: None,
            malformed: Vec::new(),
        });
        self.queue.push_back(WorkerTask {
            index,
            suite,
            channel,
        });
        index
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Sum of `run` over every report received so far
    pub fn reported_runs(&self) -> usize {
        self.tasks.iter().filter_map(|task| task.reported_run).sum()
    }

    /// Run every queued task; Ctrl-C terminates all workers and returns
    /// `RunError::Interrupted`
    pub async fn serve(&mut self) -> Result<PoolStats, RunError> {
        self.serve_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for interrupts: {err}");
                future::pending::<()>().await;
            }
        })
        .await
    }

    /// `serve`, treating completion of `interrupt` as an external interrupt
    pub async fn serve_until<F>(&mut self, interrupt: F) -> Result<PoolStats, RunError>
    where
        F: Future<Output = ()>,
    {
        for task in &self.queue {
            self.tickets.register_task(task.index, &task.suite)?;
        }

        info!(
            "Serving {} suites with up to {} worker processes",
            self.queue.len(),
            self.config.max_processes
        );
        let timer = Timer::start("process pool");

        let outcome = tokio::select! {
            biased;
            _ = interrupt => None,
            served = async {
                self.dispatch().await?;
                self.finish().await
            } => Some(served),
        };

        match outcome {
            None => {
                warn!("Interrupted; terminating {} workers", self.active.len());
                self.queue.clear();
                self.terminate_all().await;
                Err(RunError::Interrupted)
            }
            Some(Err(err)) => {
                self.queue.clear();
                self.terminate_all().await;
                Err(err)
            }
            Some(Ok(())) => {
                info!(
                    "Process pool finished in {}ms: {} started, peak {} active",
                    timer.stop().as_millis(),
                    self.stats.started,
                    self.stats.peak_active
                );
                Ok(self.stats)
            }
        }
    }

    async fn dispatch(&mut self) -> Result<(), RunError> {
        while let Some(task) = self.queue.pop_front() {
            self.wait_release().await?;
            self.collect_reports()?;
            if self.result.should_stop() {
                info!("Stop requested; {} queued suites not started", self.queue.len() + 1);
                self.queue.clear();
                break;
            }
            self.start(task)?;
        }
        self.close().await
    }

    /// Reap every worker that has exited; returns how many slots were freed
    pub async fn try_release(&mut self) -> usize {
        let mut released = 0;
        let mut index = 0;
        while index < self.active.len() {
            match self.active[index].child.try_wait() {
                Ok(Some(_)) => {
                    let mut slot = self.active.remove(index);
                    // Already exited; the kill only guards against a reused handle
                    let _ = slot.child.start_kill();
                    let status = slot.child.wait().await;
                    debug!(
                        "Reclaimed worker for task {} after {}ms ({:?})",
                        slot.task,
                        slot.started_at.elapsed().as_millis(),
                        status
                    );
                    if let (Some(record), Ok(status)) = (self.tasks.get_mut(slot.task), status) {
                        record.exit = Some(status);
                    }
                    self.stats.reclaimed += 1;
                    released += 1;
                }
                Ok(None) => index += 1,
                Err(err) => {
                    warn!("Failed to poll worker for task {}: {err}", self.active[index].task);
                    index += 1;
                }
            }
        }
        released
    }

    async fn wait_release(&mut self) -> Result<(), RunError> {
        self.try_release().await;
        if self.active.len() < self.config.max_processes {
            return Ok(());
        }

        let timer = Timer::start("slot wait");
        loop {
            sleep(self.config.poll_interval).await;
            self.try_release().await;
            if self.active.len() < self.config.max_processes {
                timer.stop();
                return Ok(());
            }
            if timer.elapsed() >= self.config.release_timeout {
                return Err(self.stuck(timer.elapsed()).await);
            }
        }
    }

    /// Join every remaining worker, bounded by `release_timeout`
    pub async fn close(&mut self) -> Result<(), RunError> {
        let timer = Timer::start("close");
        loop {
            self.try_release().await;
            if self.active.is_empty() {
                return Ok(());
            }
            let Some(left) = timer.remaining(self.config.release_timeout) else {
                return Err(self.stuck(timer.elapsed()).await);
            };
            sleep(self.config.poll_interval.min(left)).await;
        }
    }

    async fn stuck(&mut self, waited: Duration) -> RunError {
        let active = self.active.len();
        warn!("Process list has not been released for {waited:?}; terminating {active} workers");
        self.terminate_all().await;
        RunError::Timeout { waited, active }
    }

    /// Kill and join every active worker
    pub async fn terminate_all(&mut self) {
        let slots: Vec<PoolSlot> = self.active.drain(..).collect();
        for mut slot in slots {
            if let Err(err) = slot.child.start_kill() {
                debug!("Worker for task {} already gone: {err}", slot.task);
            }
            match slot.child.wait().await {
                Ok(status) => {
                    if let Some(record) = self.tasks.get_mut(slot.task) {
                        record.exit = Some(status);
                    }
                }
                Err(err) => warn!("Failed to join worker for task {}: {err}", slot.task),
            }
            self.stats.terminated += 1;
        }
    }

    fn start(&mut self, task: WorkerTask) -> Result<(), RunError> {
        let spec = WorkerSpec::for_suite(task.index, &task.suite)?;
        let mut command = self.launcher.command(&spec);
        command
            .env(WORKER_ENV, spec.to_env()?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            task: task.index,
            source,
        })?;
        if let Some(stdout) = child.stdout.take() {
            task.channel.spawn_reader(stdout);
        }

        debug!(
            "Started worker {:?} for task {} ({})",
            child.id(),
            task.index,
            task.suite.name()
        );
        if let Some(record) = self.tasks.get_mut(task.index) {
            record.started = true;
        }
        self.active.push(PoolSlot {
            child,
            started_at: Instant::now(),
            task: task.index,
        });
        self.stats.started += 1;
        self.stats.peak_active = self.stats.peak_active.max(self.active.len());
        Ok(())
    }

    fn collect_reports(&mut self) -> Result<(), RunError> {
        while let Some(message) = self.channel.try_recv() {
            self.absorb(message)?;
        }
        Ok(())
    }

    async fn drain_channel(&mut self) -> Result<(), RunError> {
        while let Some(message) = self.channel.recv().await {
            self.absorb(message)?;
        }
        Ok(())
    }

    fn absorb(&mut self, message: ChannelMessage) -> Result<(), RunError> {
        let ChannelMessage { task, payload } = message;
        let Some(record) = self.tasks.get_mut(task) else {
            warn!("Dropping message for unknown task {task}");
            return Ok(());
        };

        match payload {
            Ok(report) => {
                if record.has_reported() {
                    return Err(ReconciliationError::DuplicateReport { task }.into());
                }
                let reconciled = self.tickets.reconcile(task, &report)?;
                record.reported_run = Some(report.run);
                if !record.malformed.is_empty() {
                    debug!("Task {task}: dropping {} unreadable lines", record.malformed.len());
                    record.malformed.clear();
                }
                debug!(
                    "Task {task} reported {} units, {} diagnostics",
                    report.run,
                    report.entries.len()
                );
                self.result.merge(reconciled);
            }
            Err(message) if record.has_reported() => {
                debug!("Task {task} already reported; ignoring {message}");
            }
            Err(message) => {
                debug!("Task {task} ({}): {message}", record.suite.name());
                record.malformed.push(message);
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), RunError> {
        self.channel.close();
        let release_timeout = self.config.release_timeout;
        match timeout(release_timeout, self.drain_channel()).await {
            Ok(drained) => drained?,
            Err(_) => warn!("Worker output still open after {release_timeout:?}; ignoring late reports"),
        }
        self.record_silent_workers();
        Ok(())
    }

    /// Started tasks that never reported are errors on their suite
    fn record_silent_workers(&mut self) {
        for (index, record) in self.tasks.iter().enumerate() {
            if !record.started || record.has_reported() {
                continue;
            }
            if !record.malformed.is_empty() {
                for message in &record.malformed {
                    warn!("Task {index} ({}): {message}", record.suite.name());
                    self.result
                        .record(Category::Error, TestRef::Suite(record.suite.clone()), message.clone());
                }
                continue;
            }
            let message = match record.exit {
                Some(status) if !status.success() => {
                    format!("worker process exited with {status} before reporting results")
                }
                Some(_) => "worker process exited without reporting results".to_string(),
                None => "worker process was lost before reporting results".to_string(),
            };
            warn!("Task {index} ({}): {message}", record.suite.name());
            self.result
                .record(Category::Error, TestRef::Suite(record.suite.clone()), message);
        }
    }
}
