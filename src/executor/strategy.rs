//! Execution strategy selection
//!
//! Pure mapping from configuration to how suites and units are scheduled.
//! Precedence when several knobs are set: explicit strategy name, then
//! process count, then green pool size, then thread pool size, then
//! sequential.

use std::fmt;
use std::num::NonZeroUsize;
use std::thread;

use crate::config::{RunConfig, StrategyName};

/// Minimum size of any in-process pool
pub const MIN_POOL_SIZE: usize = 2;

/// How leaf units are scheduled inside one process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitScheduling {
    Sequential,
    GreenPool { size: usize },
    ThreadPool { size: usize },
}

impl UnitScheduling {
    pub fn pool_size(&self) -> Option<usize> {
        match self {
            UnitScheduling::Sequential => None,
            UnitScheduling::GreenPool { size } | UnitScheduling::ThreadPool { size } => Some(*size),
        }
    }
}

impl fmt::Display for UnitScheduling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitScheduling::Sequential => write!(f, "sequential"),
            UnitScheduling::GreenPool { size } => write!(f, "green pool of {size}"),
            UnitScheduling::ThreadPool { size } => write!(f, "thread pool of {size}"),
        }
    }
}

/// Top-level strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    GreenThreads,
    Threads,
    /// Each root suite runs in its own worker process
    Processes { workers: usize },
}

impl Strategy {
    pub fn name(&self) -> StrategyName {
        match self {
            Strategy::Sequential => StrategyName::Sequential,
            Strategy::GreenThreads => StrategyName::Green,
            Strategy::Threads => StrategyName::Threads,
            Strategy::Processes { .. } => StrategyName::Processes,
        }
    }
}

/// Strategy plus the in-process scheduling it runs units with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub strategy: Strategy,
    pub units: UnitScheduling,
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.strategy {
            Strategy::Processes { workers } => {
                write!(f, "processes: {workers} workers, units {}", self.units)
            }
            strategy => write!(f, "{}: units {}", strategy.name(), self.units),
        }
    }
}

/// Pool size for a configured value, falling back to half the available
/// parallelism (rounded), never below `MIN_POOL_SIZE`
pub fn pool_size(configured: usize, available: NonZeroUsize) -> usize {
    let size = if configured > 0 {
        configured
    } else {
        (available.get() + 1) / 2
    };
    size.max(MIN_POOL_SIZE)
}

/// Select the execution plan for `config` on a host with `available` cores
pub fn select(config: &RunConfig, available: NonZeroUsize) -> ExecutionPlan {
    let strategy = match config.strategy {
        Some(StrategyName::Sequential) => Strategy::Sequential,
        Some(StrategyName::Green) => Strategy::GreenThreads,
        Some(StrategyName::Threads) => Strategy::Threads,
        Some(StrategyName::Processes) => Strategy::Processes {
            workers: process_count(config.processes, available),
        },
        None if config.processes > 0 => Strategy::Processes {
            workers: config.processes,
        },
        None if config.green_threads > 0 => Strategy::GreenThreads,
        None if config.threads > 0 => Strategy::Threads,
        None => Strategy::Sequential,
    };

    let units = match strategy {
        Strategy::Sequential => UnitScheduling::Sequential,
        Strategy::GreenThreads => UnitScheduling::GreenPool {
            size: pool_size(config.green_threads, available),
        },
        Strategy::Threads => UnitScheduling::ThreadPool {
            size: pool_size(config.threads, available),
        },
        Strategy::Processes { .. } if config.green_threads > 0 => UnitScheduling::GreenPool {
            size: pool_size(config.green_threads, available),
        },
        Strategy::Processes { .. } if config.threads > 0 => UnitScheduling::ThreadPool {
            size: pool_size(config.threads, available),
        },
        Strategy::Processes { .. } => UnitScheduling::Sequential,
    };

    ExecutionPlan { strategy, units }
}

/// `select` against this host's parallelism
pub fn select_for_host(config: &RunConfig) -> ExecutionPlan {
    select(config, available_parallelism())
}

pub fn available_parallelism() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

fn process_count(configured: usize, available: NonZeroUsize) -> usize {
    if configured > 0 {
        configured
    } else {
        available.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cores(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_pool_size() {
        assert_eq!(pool_size(0, cores(8)), 4);
        assert_eq!(pool_size(0, cores(7)), 4);
        assert_eq!(pool_size(0, cores(1)), 2);
        assert_eq!(pool_size(1, cores(16)), 2);
        assert_eq!(pool_size(10, cores(2)), 10);
    }

    #[test]
    fn test_default_is_sequential() {
        let plan = select(&RunConfig::default(), cores(8));
        assert_eq!(plan.strategy, Strategy::Sequential);
        assert_eq!(plan.units, UnitScheduling::Sequential);
    }

    #[test]
    fn test_precedence() {
        let config = RunConfig::default()
            .with_processes(3)
            .with_green_threads(5)
            .with_threads(7);
        let plan = select(&config, cores(8));
        assert_eq!(plan.strategy, Strategy::Processes { workers: 3 });
        assert_eq!(plan.units, UnitScheduling::GreenPool { size: 5 });

        let config = RunConfig::default().with_green_threads(5).with_threads(7);
        assert_eq!(select(&config, cores(8)).strategy, Strategy::GreenThreads);

        let config = RunConfig::default().with_threads(7);
        let plan = select(&config, cores(8));
        assert_eq!(plan.strategy, Strategy::Threads);
        assert_eq!(plan.units, UnitScheduling::ThreadPool { size: 7 });
    }

    #[test]
    fn test_named_strategy_wins() {
        let config = RunConfig::default()
            .with_strategy(StrategyName::Threads)
            .with_processes(4);
        let plan = select(&config, cores(6));
        assert_eq!(plan.strategy, Strategy::Threads);
        assert_eq!(plan.units, UnitScheduling::ThreadPool { size: 3 });

        let config = RunConfig::default().with_strategy(StrategyName::Sequential).with_threads(4);
        assert_eq!(select(&config, cores(6)).units, UnitScheduling::Sequential);
    }

    #[test]
    fn test_named_processes_defaults_to_host_cores() {
        let config = RunConfig::default().with_strategy(StrategyName::Processes);
        let plan = select(&config, cores(6));
        assert_eq!(plan.strategy, Strategy::Processes { workers: 6 });
        assert_eq!(plan.units, UnitScheduling::Sequential);
        assert_eq!(plan.to_string(), "processes: 6 workers, units sequential");
    }

    #[test]
    fn test_selection_is_repeatable() {
        let config = RunConfig::default().with_green_threads(3);
        assert_eq!(select(&config, cores(4)), select(&config, cores(4)));
    }
}
