//! Bounded worker pool.
//!
//! Each submitted task occupies one slot until it finishes. When every slot
//! is taken, `submit` waits, which in turn stalls the accept loop.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Returned by `submit` once the pool has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolClosed;

impl std::fmt::Display for PoolClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker pool is shut down")
    }
}

impl std::error::Error for PoolClosed {}

/// Fixed-capacity pool of session slots
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool with `size` slots
    pub fn new(size: NonZeroUsize) -> Self {
        let size = size.get();
        info!(size, "Initializing worker pool");
        WorkerPool {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Number of slots currently occupied
    pub fn active(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    /// Run `task` in a free slot, waiting for one if the pool is full.
    ///
    /// The slot is released when the task completes or panics.
    pub async fn submit<F>(&self, task: F) -> Result<JoinHandle<()>, PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.slots.available_permits() == 0 {
            debug!(size = self.size, "All worker slots busy, waiting");
        }

        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;

        Ok(tokio::spawn(async move {
            let _permit = permit;
            task.await;
        }))
    }

    /// Stop accepting work and wait up to `grace` for running tasks.
    ///
    /// Returns the number of tasks still running when the wait ended.
    pub async fn shutdown(self, grace: Duration) -> usize {
        let active = self.active();
        if active > 0 {
            info!(active, grace_secs = grace.as_secs(), "Waiting for sessions to finish");
        }

        let all_slots = u32::try_from(self.size).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(grace, self.slots.acquire_many(all_slots)).await;
        self.slots.close();

        match drained {
            Ok(_) => 0,
            Err(_) => {
                let remaining = self.active();
                warn!(remaining, "Shutdown grace period elapsed with sessions running");
                remaining
            }
        }
    }
}
