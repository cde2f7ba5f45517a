//! Cross-process result channel
//!
//! A worker prints one report line to stdout: `REPORT_PREFIX` followed by
//! the JSON-encoded `WorkerReport`. The coordinator reads each worker's
//! stdout on its own task and forwards decoded reports over an mpsc channel.
//! Only tickets cross the boundary, never live test objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::ReconciliationError;
use crate::models::{Category, ResultAccumulator, Ticket};

/// Marks the report line in worker output
pub const REPORT_PREFIX: &str = "suite-pool-report:";

/// One diagnostic as it crosses the process boundary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    pub ticket: Ticket,
    pub category: Category,
    pub message: String,
}

/// Everything a worker reports about its suite
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub first_ticket: Ticket,
    pub run: usize,
    pub entries: Vec<WireEntry>,
    pub should_stop: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkerReport {
    /// Flatten an accumulator into ticket-addressed entries
    pub fn from_accumulator(
        first_ticket: Ticket,
        accumulator: &ResultAccumulator,
        started_at: DateTime<Utc>,
    ) -> Result<Self, ReconciliationError> {
        let entries = accumulator
            .diagnostics()
            .map(|(category, diagnostic)| {
                let ticket = diagnostic
                    .test
                    .ticket()
                    .ok_or_else(|| ReconciliationError::Unticketed {
                        name: diagnostic.test.name().to_string(),
                    })?;
                Ok(WireEntry {
                    ticket,
                    category,
                    message: diagnostic.message.clone(),
                })
            })
            .collect::<Result<Vec<_>, ReconciliationError>>()?;

        Ok(Self {
            first_ticket,
            run: accumulator.run,
            entries,
            should_stop: accumulator.should_stop,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Report line, without a trailing newline
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(format!("{REPORT_PREFIX}{}", serde_json::to_string(self)?))
    }

    /// Decode a line of worker output; `None` if it carries no report.
    ///
    /// The prefix may appear mid-line, after whatever else the worker
    /// printed without a newline.
    pub fn decode(line: &str) -> Option<Result<Self, serde_json::Error>> {
        let start = line.find(REPORT_PREFIX)? + REPORT_PREFIX.len();
        Some(serde_json::from_str(line[start..].trim_end()))
    }
}

/// A report (or why there is none) from one task's worker
#[derive(Debug)]
pub struct ChannelMessage {
    pub task: usize,
    pub payload: Result<WorkerReport, String>,
}

/// Receiving end held by the coordinator
#[derive(Debug)]
pub struct ResultChannel {
    tx: Option<UnboundedSender<ChannelMessage>>,
    rx: UnboundedReceiver<ChannelMessage>,
}

impl ResultChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx: Some(tx), rx }
    }

    /// Sender bound to `task`; reopens the channel if it was closed
    pub fn sender(&mut self, task: usize) -> ResultSender {
        let tx = match &self.tx {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.rx = rx;
                self.tx = Some(tx.clone());
                tx
            }
        };
        ResultSender { task, tx }
    }

    /// Drop the coordinator's own sender so `recv` ends once every worker
    /// reader has finished
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }
}

impl Default for ResultChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Producing end for one task
#[derive(Clone, Debug)]
pub struct ResultSender {
    task: usize,
    tx: UnboundedSender<ChannelMessage>,
}

impl ResultSender {
    pub fn task(&self) -> usize {
        self.task
    }

    /// Returns false once the coordinator has gone away
    pub fn send(&self, payload: Result<WorkerReport, String>) -> bool {
        self.tx
            .send(ChannelMessage {
                task: self.task,
                payload,
            })
            .is_ok()
    }

    /// Forward every report found in `output` until it reaches EOF
    pub fn spawn_reader<R>(self, output: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(output).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match WorkerReport::decode(&line) {
                        Some(decoded) => {
                            let payload =
                                decoded.map_err(|err| format!("malformed worker report: {err}"));
                            self.send(payload);
                        }
                        None => trace!("worker {}: {line}", self.task),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        self.send(Err(format!("failed to read worker output: {err}")));
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TestRef, TestUnit};
    use std::sync::Arc;

    fn sample_report() -> WorkerReport {
        let now = Utc::now();
        WorkerReport {
            first_ticket: Ticket(4),
            run: 2,
            entries: vec![WireEntry {
                ticket: Ticket(6),
                category: Category::Failure,
                message: "expected \"ok\"\nfound \"err\"".to_string(),
            }],
            should_stop: false,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_decode_tolerates_surrounding_noise() {
        let report = sample_report();
        let line = format!("running 1 test .{}   ", report.encode().unwrap());

        let decoded = WorkerReport::decode(&line).unwrap().unwrap();
        assert_eq!(decoded, report);
        assert!(WorkerReport::decode("test result: ok. 1 passed").is_none());
    }

    #[test]
    fn test_decode_reports_malformed_json() {
        let decoded = WorkerReport::decode(&format!("{REPORT_PREFIX}{{\"run\":")).unwrap();
        assert!(decoded.is_err());
    }

    #[test]
    fn test_from_accumulator_requires_tickets() {
        let mut accumulator = ResultAccumulator::new();
        accumulator.start_test();
        accumulator.add_error(TestRef::Unit(Arc::new(TestUnit::new("loose", |_| Ok(())))), "x");

        let err = WorkerReport::from_accumulator(Ticket(1), &accumulator, Utc::now()).unwrap_err();
        assert!(matches!(err, ReconciliationError::Unticketed { .. }));
    }

    #[tokio::test]
    async fn test_reader_forwards_reports() {
        let mut channel = ResultChannel::new();
        let sender = channel.sender(3);
        let report = sample_report();
        let output = format!(
            "noise before\n{}\n{REPORT_PREFIX}not json\n",
            report.encode().unwrap()
        );

        sender.spawn_reader(std::io::Cursor::new(output.into_bytes())).await.unwrap();
        channel.close();

        let first = channel.recv().await.unwrap();
        assert_eq!(first.task, 3);
        assert_eq!(first.payload.unwrap(), report);

        let second = channel.recv().await.unwrap();
        assert!(second.payload.unwrap_err().starts_with("malformed worker report"));
        assert!(channel.recv().await.is_none());
    }

    #[test]
    fn test_closed_channel_reopens_for_new_senders() {
        let mut channel = ResultChannel::new();
        channel.close();
        assert!(channel.try_recv().is_none());

        let sender = channel.sender(0);
        assert!(sender.send(Err("lost".to_string())));
        assert_eq!(channel.try_recv().unwrap().payload.unwrap_err(), "lost");
    }
}
