//! Replay of the buffered backlog once the broker is reachable.
//!
//! Batches go out oldest first and sequentially, with a fixed pause between
//! publishes to bound the burst after a long outage. The first failure ends
//! the batch; whatever is left stays unpublished for the next pass.

use crate::publisher::TelemetryPublisher;
use crate::shutdown::Shutdown;
use crate::store::{StorageError, TelemetryStore};
use crate::time::unix_now;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DrainSettings {
    /// Pause between drain passes while connected
    pub interval: Duration,
    pub batch_size: usize,
    /// Pause between consecutive publishes within a batch
    pub pacing: Duration,
    /// Published records older than this are evicted
    pub retention: Duration,
    pub store_timeout: Duration,
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Records fetched for this pass
    pub fetched: usize,
    pub published: usize,
    /// The batch stopped early on a publish failure
    pub interrupted: bool,
    pub evicted: usize,
}

pub struct ReplayDrainer {
    store: Arc<TelemetryStore>,
    publisher: TelemetryPublisher,
    settings: DrainSettings,
}

impl ReplayDrainer {
    pub fn new(
        store: Arc<TelemetryStore>,
        publisher: TelemetryPublisher,
        settings: DrainSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
        }
    }

    /// Drain until shutdown. Idles without touching the store while the
    /// broker is not connected.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut state = self.publisher.watch_state();
        info!(
            interval_s = self.settings.interval.as_secs(),
            batch_size = self.settings.batch_size,
            "Replay drainer started"
        );

        while !shutdown.is_requested() {
            let connected = state.borrow_and_update().is_connected();
            if !connected {
                tokio::select! {
                    _ = shutdown.requested() => break,
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            match self.drain_once().await {
                Ok(report) if report.fetched > 0 => info!(
                    published = report.published,
                    remaining = report.fetched - report.published,
                    interrupted = report.interrupted,
                    evicted = report.evicted,
                    "Replayed buffered readings"
                ),
                Ok(report) => debug!(evicted = report.evicted, "Backlog empty"),
                Err(e) => warn!(error = %e, "Replay pass failed"),
            }

            if !shutdown.sleep(self.settings.interval).await {
                break;
            }
        }

        info!("Replay drainer stopped");
    }

    /// One pass: publish a batch, flag each success, then evict expired
    /// published records.
    pub async fn drain_once(&self) -> Result<DrainReport, StorageError> {
        let limit = self.settings.batch_size;
        let batch = self
            .store
            .run_blocking(self.settings.store_timeout, move |store| {
                store.fetch_unpublished(limit)
            })
            .await?;

        let mut report = DrainReport {
            fetched: batch.len(),
            ..Default::default()
        };

        for (i, record) in batch.into_iter().enumerate() {
            if i > 0 && !self.settings.pacing.is_zero() {
                tokio::time::sleep(self.settings.pacing).await;
            }

            let reading = record.reading;
            if let Err(e) = self.publisher.publish_reading(&reading).await {
                warn!(
                    device = %reading.device_id,
                    error = %e,
                    "Replay interrupted, keeping remainder buffered"
                );
                report.interrupted = true;
                break;
            }
            report.published += 1;

            let flagged = self
                .store
                .run_blocking(self.settings.store_timeout, move |store| {
                    store.mark_published(&reading.device_id, reading.sample_timestamp, unix_now())
                })
                .await;
            if let Err(e) = flagged {
                warn!(error = %e, "Failed to flag replayed reading as published");
            }
        }

        let cutoff = unix_now().saturating_sub(self.settings.retention.as_secs() as i64);
        match self
            .store
            .run_blocking(self.settings.store_timeout, move |store| {
                store.evict_published_older_than(cutoff)
            })
            .await
        {
            Ok(evicted) => report.evicted = evicted,
            Err(e) => warn!(error = %e, "Retention eviction failed"),
        }

        Ok(report)
    }
}
