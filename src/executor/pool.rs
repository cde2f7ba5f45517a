//! Bounded in-process unit pools
//!
//! One pool is shared by a whole forest so nested suites never multiply
//! concurrency. A permit is held for as long as a unit runs, including the
//! time a blocking body spends on the blocking thread pool.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use super::strategy::UnitScheduling;

/// Kind of in-process pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    /// Cooperative: units are polled by the suite future and yield between
    /// dispatches; blocking bodies still move to the blocking pool
    Green,
    /// Preemptive: units run on runtime workers, blocking bodies on the blocking pool
    Threads,
}

/// Bounded pool handle; clones share the same permits
#[derive(Clone, Debug)]
pub struct UnitPool {
    kind: PoolKind,
    size: usize,
    permits: Arc<Semaphore>,
}

impl UnitPool {
    pub fn new(kind: PoolKind, size: usize) -> Self {
        let size = size.max(1);
        Self {
            kind,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn green(size: usize) -> Self {
        Self::new(PoolKind::Green, size)
    }

    pub fn threads(size: usize) -> Self {
        Self::new(PoolKind::Threads, size)
    }

    /// Pool for a scheduling mode; `None` when units run sequentially
    pub fn for_scheduling(scheduling: UnitScheduling) -> Option<Self> {
        match scheduling {
            UnitScheduling::Sequential => None,
            UnitScheduling::GreenPool { size } => Some(Self::green(size)),
            UnitScheduling::ThreadPool { size } => Some(Self::threads(size)),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("unit pool permits are never closed"),
        }
    }

    /// Run `unit` while holding `permit`.
    ///
    /// Green units are returned for the caller to poll, behind a yield so
    /// siblings interleave. Thread units are spawned and the returned future
    /// only awaits their completion.
    pub(crate) fn dispatch<F>(&self, permit: OwnedSemaphorePermit, unit: F) -> BoxFuture<'static, ()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.kind {
            PoolKind::Green => async move {
                let _permit = permit;
                tokio::task::yield_now().await;
                unit.await;
            }
            .boxed(),
            PoolKind::Threads => {
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    unit.await;
                });
                async move {
                    if let Err(err) = handle.await {
                        warn!("Pooled unit task ended abnormally: {err}");
                    }
                }
                .boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_scheduling() {
        assert!(UnitPool::for_scheduling(UnitScheduling::Sequential).is_none());

        let pool = UnitPool::for_scheduling(UnitScheduling::ThreadPool { size: 3 }).unwrap();
        assert_eq!(pool.kind(), PoolKind::Threads);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.available(), 3);

        let _held = tokio_test::block_on(pool.acquire());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_zero_size_still_admits_one() {
        let pool = UnitPool::green(0);
        assert_eq!(pool.size(), 1);
        let permit = tokio_test::block_on(pool.acquire());
        assert_eq!(pool.available(), 0);
        drop(permit);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_permits() {
        let pool = UnitPool::green(2);
        let other = pool.clone();

        let first = pool.acquire().await;
        let _second = other.acquire().await;
        assert_eq!(pool.available(), 0);

        drop(first);
        assert_eq!(other.available(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_releases_permit_when_done() {
        let pool = UnitPool::threads(1);
        let permit = pool.acquire().await;
        assert_eq!(pool.available(), 0);

        pool.dispatch(permit, async {}).await;
        assert_eq!(pool.available(), 1);
    }
}
