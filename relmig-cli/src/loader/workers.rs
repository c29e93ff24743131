//! Worker limiter for concurrent batch writes
//!
//! Semaphore-based limiter bounding how many batch tasks of one table write
//! at the same time.

use anyhow::{Context, Result};
use log::debug;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Semaphore-based limiter for batch workers
#[derive(Debug, Clone)]
pub struct WorkerLimiter {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerLimiter {
    /// Create a limiter allowing `max_workers` concurrent batches (at least one)
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Acquire a permit for one batch. Waits if at capacity.
    /// The permit releases automatically when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        if self.semaphore.available_permits() == 0 {
            debug!("Worker limiter: waiting for permit ({} in use)", self.max_workers);
        }

        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .context("Failed to acquire worker permit")
    }
}
