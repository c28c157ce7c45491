//! Expiry sweeper.
//!
//! Deletes records whose expiry has passed, in bounded atomic batches. The
//! limiter never counts stale records, so this only keeps the store small.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::RequestStore;

/// Records deleted per batch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 500;
/// Upper bound on a batch, matching common store write-batch limits.
pub const MAX_BATCH_SIZE: usize = 500;

pub struct ExpirySweeper {
    store: Arc<dyn RequestStore>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn RequestStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the batch size, clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Delete every record that expired at or before now.
    ///
    /// Returns the number of records deleted. An error aborts the sweep;
    /// batches deleted before it stay deleted.
    pub async fn sweep(&self) -> Result<u64> {
        let cutoff = self.clock.now();
        let mut deleted: u64 = 0;
        let mut batches: u64 = 0;

        loop {
            let page = match self.sweep_page(cutoff).await {
                Ok(page) => page,
                Err(e) => {
                    error!(
                        deleted = deleted,
                        batches = batches,
                        error = %e,
                        "Expiry sweep aborted"
                    );
                    return Err(e);
                }
            };

            let Some((fetched, removed)) = page else {
                break;
            };
            deleted += removed;
            batches += 1;

            debug!(fetched = fetched, deleted = removed, "Deleted expired batch");

            if fetched < self.batch_size {
                break;
            }
        }

        info!(deleted = deleted, batches = batches, cutoff = %cutoff, "Expiry sweep complete");
        Ok(deleted)
    }

    /// Fetch and delete one page. `None` when nothing is left.
    async fn sweep_page(&self, cutoff: DateTime<Utc>) -> Result<Option<(usize, u64)>> {
        let ids = self.store.expired_ids(cutoff, self.batch_size).await?;
        if ids.is_empty() {
            return Ok(None);
        }
        let removed = self.store.delete_batch(&ids).await?;
        Ok(Some((ids.len(), removed)))
    }

    /// Sweep every `every` until `shutdown` resolves.
    pub async fn run_periodic<F>(&self, every: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = every.as_secs(), "Expiry sweeper started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Expiry sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    // Failures are logged by sweep; the next tick picks up the rest.
                    let _ = self.sweep().await;
                }
            }
        }
    }
}
