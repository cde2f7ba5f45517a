//! Process pool execution
//!
//! Runs root suites in isolated worker processes and reconciles their
//! reports onto the original forest through tickets.

mod channel;
mod coordinator;
mod launcher;
mod tickets;
pub mod worker;

pub use channel::{ChannelMessage, ResultChannel, ResultSender, WireEntry, WorkerReport, REPORT_PREFIX};
pub use coordinator::{PoolConfig, PoolSlot, PoolStats, ProcessPool, WorkerTask};
pub use launcher::{CommandLauncher, WorkerLauncher, WorkerSpec, WORKER_ENV};
pub use tickets::TicketMap;
