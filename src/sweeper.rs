//! Expiry sweeper
//!
//! Periodically walks every object in the blob store and deletes the ones whose
//! stamped expiry has passed. This is the only place objects are reclaimed after
//! expiry. It never touches the metadata index: records pointing at swept blobs
//! are dropped by the read path the next time someone asks for them.
//!
//! Objects without a readable stamp (written by something else, or damaged) fall
//! under the bucket lifecycle window instead: once older than that window they
//! are removed too.

use crate::blob_store::BlobStore;
use crate::clock::Clock;
use crate::error::StorageError;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys looked at
    pub scanned: u64,
    /// Objects removed
    pub deleted: u64,
    /// Keys that disappeared before we got to them
    pub already_gone: u64,
    /// Keys that could not be handled this round
    pub failed: u64,
}

enum KeyOutcome {
    Kept,
    Deleted,
    AlreadyGone,
}

pub struct Sweeper {
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    lifecycle: Option<chrono::Duration>,
    /// Held for the duration of a pass
    running: Mutex<()>,
}

impl Sweeper {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        lifecycle: Option<chrono::Duration>,
    ) -> Self {
        Self {
            blobs,
            clock,
            interval,
            lifecycle,
            running: Mutex::new(()),
        }
    }

    /// Run one pass. Returns `None` without doing anything if a pass is already
    /// in progress.
    pub async fn sweep_once(&self) -> Option<SweepReport> {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Sweep already in progress, skipping");
                return None;
            }
        };

        let now = self.clock.now();
        let mut report = SweepReport::default();
        let mut keys = self.blobs.list_all();

        while let Some(key) = keys.next().await {
            let key = match key {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Listing failed, ending sweep early");
                    report.failed += 1;
                    break;
                }
            };

            report.scanned += 1;

            match self.sweep_key(&key, now).await {
                Ok(KeyOutcome::Kept) => {}
                Ok(KeyOutcome::Deleted) => report.deleted += 1,
                Ok(KeyOutcome::AlreadyGone) => report.already_gone += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to sweep key");
                    report.failed += 1;
                }
            }
        }

        if report.deleted > 0 || report.failed > 0 {
            info!(
                scanned = report.scanned,
                deleted = report.deleted,
                already_gone = report.already_gone,
                failed = report.failed,
                "Sweep complete"
            );
        } else {
            debug!(scanned = report.scanned, "Sweep complete, nothing expired");
        }

        Some(report)
    }

    async fn sweep_key(&self, key: &str, now: DateTime<Utc>) -> Result<KeyOutcome, StorageError> {
        let expired = match self.blobs.stat(key).await {
            Ok(metadata) => metadata.is_expired(now),
            Err(e) if e.is_not_found() => return Ok(KeyOutcome::AlreadyGone),
            Err(StorageError::MissingStamp(_)) => self.past_lifecycle(key, now).await?,
            Err(e) => return Err(e),
        };

        if !expired {
            return Ok(KeyOutcome::Kept);
        }

        self.blobs.delete(key).await?;
        debug!(key = %key, "Swept expired blob");
        Ok(KeyOutcome::Deleted)
    }

    async fn past_lifecycle(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let window = match self.lifecycle {
            Some(window) => window,
            None => return Ok(false),
        };

        match self.blobs.last_modified(key).await {
            Ok(modified) => Ok(modified + window <= now),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run the sweep loop as a background task
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(shutdown_rx));
        SweeperHandle { shutdown, task }
    }

    /// Sweep on every tick until `shutdown` fires.
    ///
    /// Passes run inline in this loop, so a slow pass delays the next tick rather
    /// than overlapping it; ticks missed meanwhile are skipped.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = self.interval.as_secs(), "Sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// A sweep loop started with [`Sweeper::spawn`]
pub struct SweeperHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop between passes and wait for the loop to exit. A panicked loop comes
    /// back as the `JoinError`.
    pub async fn stop(self) -> Result<(), JoinError> {
        let _ = self.shutdown.send(());
        self.task.await
    }
}
