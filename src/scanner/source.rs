//! Scan loop: turns observations into buffered, and when possible
//! immediately published, readings.
//!
//! Every accepted reading is written to the store before any publish is
//! attempted, so a crash between the two at worst re-sends it later.

use super::{ScanError, Scanner};
use crate::codec::decode_frame;
use crate::publisher::TelemetryPublisher;
use crate::reading::{Advertisement, Reading};
use crate::registry::{DeviceRegistry, Observation};
use crate::shutdown::Shutdown;
use crate::store::TelemetryStore;
use crate::time::unix_now;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Length of one scan cycle
    pub window: Duration,
    /// Pause after a failed scan before retrying
    pub failure_backoff: Duration,
    /// Upper bound on any single store operation
    pub store_timeout: Duration,
}

/// What happened to one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Not a sensor frame
    Ignored,
    /// Sensor frame that failed the integrity check
    Rejected,
    /// Re-broadcast of a sample already accepted
    Duplicate,
    /// Buffered; `published` tells whether the direct publish went out
    Buffered { published: bool },
    /// The store write failed. Unless `published`, the sample stays
    /// uncommitted and its next re-broadcast is ingested again.
    NotBuffered { published: bool },
}

/// Counters for one scan cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub observed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub published: usize,
}

pub struct ScanSource {
    scanner: Arc<dyn Scanner>,
    store: Arc<TelemetryStore>,
    registry: Arc<DeviceRegistry>,
    publisher: TelemetryPublisher,
    settings: ScanSettings,
}

impl ScanSource {
    pub fn new(
        scanner: Arc<dyn Scanner>,
        store: Arc<TelemetryStore>,
        registry: Arc<DeviceRegistry>,
        publisher: TelemetryPublisher,
        settings: ScanSettings,
    ) -> Self {
        Self {
            scanner,
            store,
            registry,
            publisher,
            settings,
        }
    }

    /// Scan cycles until shutdown. Scan failures back off and retry.
    ///
    /// Shutdown cuts a scan window short, but observations already returned
    /// by the scanner are always ingested in full before the loop exits.
    pub async fn run(&self, mut shutdown: Shutdown) {
        info!(window_ms = self.settings.window.as_millis() as u64, "Scan loop started");

        while !shutdown.is_requested() {
            let scanned = tokio::select! {
                _ = shutdown.requested() => break,
                scanned = self.scanner.scan(self.settings.window) => scanned,
            };

            match scanned {
                Ok(observations) => {
                    let summary = self.ingest_all(&observations).await;
                    self.log_cycle(&summary);
                }
                Err(e) => {
                    warn!(error = %e, "Scan failed, retrying");
                    if !shutdown.sleep(self.settings.failure_backoff).await {
                        break;
                    }
                }
            }
        }

        info!("Scan loop stopped");
    }

    fn log_cycle(&self, summary: &CycleSummary) {
        if summary.accepted > 0 {
            info!(
                observed = summary.observed,
                accepted = summary.accepted,
                published = summary.published,
                devices = self.registry.len(),
                "Scan cycle complete"
            );
        } else {
            debug!(
                observed = summary.observed,
                rejected = summary.rejected,
                devices = self.registry.len(),
                "Scan cycle complete"
            );
        }
    }

    /// One scan window, with every observation ingested.
    pub async fn run_cycle(&self) -> Result<CycleSummary, ScanError> {
        let observations = self.scanner.scan(self.settings.window).await?;
        Ok(self.ingest_all(&observations).await)
    }

    async fn ingest_all(&self, observations: &[Advertisement]) -> CycleSummary {
        let mut summary = CycleSummary {
            observed: observations.len(),
            ..Default::default()
        };
        for advertisement in observations {
            match self.ingest(advertisement, unix_now()).await {
                Ingest::Buffered { published } => {
                    summary.accepted += 1;
                    summary.published += usize::from(published);
                }
                Ingest::NotBuffered { published } => {
                    summary.published += usize::from(published);
                }
                Ingest::Rejected => summary.rejected += 1,
                Ingest::Ignored | Ingest::Duplicate => {}
            }
        }
        summary
    }

    /// Decode, deduplicate, buffer, then try the direct publish.
    pub async fn ingest(&self, advertisement: &Advertisement, now: i64) -> Ingest {
        let reading = match decode_frame(advertisement, now) {
            Ok(Some(reading)) => reading,
            Ok(None) => return Ingest::Ignored,
            Err(e) => {
                debug!(mac = %advertisement.mac, error = %e, "Discarding corrupt frame");
                return Ingest::Rejected;
            }
        };

        if self
            .registry
            .observe(&reading.device_id, reading.sample_timestamp, now)
            == Observation::Repeat
        {
            return Ingest::Duplicate;
        }

        let record = reading.clone();
        let buffered = self
            .store
            .run_blocking(self.settings.store_timeout, move |store| store.append(&record))
            .await;
        match buffered {
            Ok(id) => {
                self.registry
                    .commit_sample(&reading.device_id, reading.sample_timestamp);
                debug!(
                    device = %reading.device_id,
                    timestamp = reading.sample_timestamp,
                    id,
                    "Reading buffered"
                );
            }
            Err(e) => {
                warn!(device = %reading.device_id, error = %e, "Failed to buffer reading");
                let published = self.publish_direct(&reading).await;
                if published {
                    self.registry
                        .commit_sample(&reading.device_id, reading.sample_timestamp);
                }
                return Ingest::NotBuffered { published };
            }
        }

        let published = self.publish_direct(&reading).await;
        if published {
            self.mark_published(&reading).await;
        }
        Ingest::Buffered { published }
    }

    async fn publish_direct(&self, reading: &Reading) -> bool {
        if !self.publisher.is_connected() {
            return false;
        }
        if let Err(e) = self.publisher.publish_reading(reading).await {
            debug!(device = %reading.device_id, error = %e, "Direct publish failed");
            return false;
        }
        true
    }

    async fn mark_published(&self, reading: &Reading) {
        let device_id = reading.device_id.clone();
        let sample_timestamp = reading.sample_timestamp;
        let flagged = self
            .store
            .run_blocking(self.settings.store_timeout, move |store| {
                store.mark_published(&device_id, sample_timestamp, unix_now())
            })
            .await;
        if let Err(e) = flagged {
            // Stays unpublished and will be replayed.
            warn!(device = %reading.device_id, error = %e, "Failed to flag reading as published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectionState;
    use crate::codec::MANUFACTURER_ID;
    use crate::mac_address::MacAddress;
    use crate::scanner::ScanFuture;
    use crate::shutdown::ShutdownTrigger;
    use crate::test_utils::{
        FakeBroker, FakeScanner, TEST_MAC, advertisement, sensor_advertisement,
    };
    use crate::topics::Topics;
    use tokio::time::timeout;

    fn settings() -> ScanSettings {
        ScanSettings {
            window: Duration::from_millis(10),
            failure_backoff: Duration::from_millis(10),
            store_timeout: Duration::from_secs(2),
        }
    }

    fn source_with(
        scanner: impl Scanner + 'static,
        store: Arc<TelemetryStore>,
        registry: Arc<DeviceRegistry>,
        broker: Arc<FakeBroker>,
    ) -> ScanSource {
        let publisher = TelemetryPublisher::new(broker, Topics::new("b1", "gw"), "gw");
        ScanSource::new(Arc::new(scanner), store, registry, publisher, settings())
    }

    fn source(
        scanner: FakeScanner,
        broker: Arc<FakeBroker>,
    ) -> (ScanSource, Arc<TelemetryStore>, Arc<DeviceRegistry>) {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let registry = Arc::new(DeviceRegistry::new());
        let source = source_with(scanner, store.clone(), registry.clone(), broker);
        (source, store, registry)
    }

    fn closed_store() -> Arc<TelemetryStore> {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        store.close().unwrap();
        store
    }

    /// Requests shutdown as soon as its scan window returns.
    struct StoppingScanner {
        inner: FakeScanner,
        trigger: ShutdownTrigger,
    }

    impl Scanner for StoppingScanner {
        fn scan(&self, window: Duration) -> ScanFuture<'_> {
            Box::pin(async move {
                let result = self.inner.scan(window).await;
                self.trigger.trigger();
                result
            })
        }
    }

    #[tokio::test]
    async fn test_disconnected_reading_is_buffered_only() {
        let broker = FakeBroker::new(ConnectionState::Disconnected);
        let (source, store, _) = source(FakeScanner::default(), broker.clone());

        let outcome = source.ingest(&sensor_advertisement(TEST_MAC, 1000), 1001).await;

        assert_eq!(outcome, Ingest::Buffered { published: false });
        assert!(broker.published().is_empty());
        assert_eq!(store.count_unpublished().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_connected_reading_published_and_flagged() {
        let broker = FakeBroker::new(ConnectionState::Connected);
        let (source, store, _) = source(FakeScanner::default(), broker.clone());

        let outcome = source.ingest(&sensor_advertisement(TEST_MAC, 1000), 1001).await;

        assert_eq!(outcome, Ingest::Buffered { published: true });
        let sent = broker.on_topic("/telemetry");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].json()["device_id"], "aabbccddeeff");
        assert_eq!(sent[0].json()["received_at"], 1001);
        assert_eq!(store.count_unpublished().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_direct_publish_left_for_replay() {
        let broker = FakeBroker::new(ConnectionState::Connected);
        broker.disconnect_after(0);
        let (source, store, _) = source(FakeScanner::default(), broker.clone());

        let outcome = source.ingest(&sensor_advertisement(TEST_MAC, 1000), 1001).await;

        assert_eq!(outcome, Ingest::Buffered { published: false });
        assert_eq!(store.count_unpublished().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_frame_not_buffered() {
        let broker = FakeBroker::new(ConnectionState::Connected);
        let (source, store, registry) = source(FakeScanner::default(), broker.clone());

        let mut adv = sensor_advertisement(TEST_MAC, 1000);
        adv.data[0] ^= 0x01;

        assert_eq!(source.ingest(&adv, 1001).await, Ingest::Rejected);
        assert_eq!(store.count_unpublished().unwrap(), 0);
        assert!(registry.is_empty());
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_advertisement_ignored() {
        let broker = FakeBroker::new(ConnectionState::Connected);
        let (source, store, _) = source(FakeScanner::default(), broker);

        let mut adv = advertisement(TEST_MAC, vec![0x01, 0x02]);
        adv.manufacturer_id = 0x004C;
        assert_ne!(adv.manufacturer_id, MANUFACTURER_ID);

        assert_eq!(source.ingest(&adv, 1).await, Ingest::Ignored);
        assert_eq!(store.count_unpublished().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rebroadcast_stored_once() {
        let broker = FakeBroker::new(ConnectionState::Disconnected);
        let (source, store, _) = source(FakeScanner::default(), broker);
        let adv = sensor_advertisement(TEST_MAC, 1000);

        assert_eq!(
            source.ingest(&adv, 1001).await,
            Ingest::Buffered { published: false }
        );
        assert_eq!(source.ingest(&adv, 1002).await, Ingest::Duplicate);
        assert_eq!(store.count_unpublished().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rebroadcast_retried_after_store_failure() {
        let broker = FakeBroker::new(ConnectionState::Disconnected);
        let registry = Arc::new(DeviceRegistry::new());
        let adv = sensor_advertisement(TEST_MAC, 1000);

        let failing = source_with(
            FakeScanner::default(),
            closed_store(),
            registry.clone(),
            broker.clone(),
        );
        assert_eq!(
            failing.ingest(&adv, 1001).await,
            Ingest::NotBuffered { published: false }
        );
        assert_eq!(registry.last_seen("aabbccddeeff"), Some(1001));

        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let recovered = source_with(FakeScanner::default(), store.clone(), registry, broker);
        assert_eq!(
            recovered.ingest(&adv, 1002).await,
            Ingest::Buffered { published: false }
        );
        assert_eq!(recovered.ingest(&adv, 1003).await, Ingest::Duplicate);
        assert_eq!(store.count_unpublished().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unbuffered_reading_still_published_when_connected() {
        let broker = FakeBroker::new(ConnectionState::Connected);
        let registry = Arc::new(DeviceRegistry::new());
        let source = source_with(
            FakeScanner::default(),
            closed_store(),
            registry,
            broker.clone(),
        );
        let adv = sensor_advertisement(TEST_MAC, 1000);

        assert_eq!(
            source.ingest(&adv, 1001).await,
            Ingest::NotBuffered { published: true }
        );
        assert_eq!(source.ingest(&adv, 1002).await, Ingest::Duplicate);
        assert_eq!(broker.on_topic("/telemetry").len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_summary_counts() {
        let other = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let mut corrupt = sensor_advertisement(other, 5);
        corrupt.data[17] ^= 0xFF;
        let scanner = FakeScanner::new(vec![Ok(vec![
            sensor_advertisement(TEST_MAC, 1000),
            sensor_advertisement(other, 1000),
            corrupt,
            advertisement(TEST_MAC, vec![0u8; 4]),
        ])]);
        let broker = FakeBroker::new(ConnectionState::Connected);
        let (source, store, registry) = source(scanner, broker.clone());

        let summary = source.run_cycle().await.unwrap();

        assert_eq!(
            summary,
            CycleSummary {
                observed: 4,
                accepted: 2,
                rejected: 1,
                published: 2,
            }
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(store.count_unpublished().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_survives_scan_failure_and_stops_on_shutdown() {
        let scanner = FakeScanner::new(vec![
            Err(ScanError::Bluetooth("adapter gone".to_string())),
            Ok(vec![sensor_advertisement(TEST_MAC, 1000)]),
        ]);
        let broker = FakeBroker::new(ConnectionState::Disconnected);
        let (source, store, _) = source(scanner, broker);
        let (trigger, shutdown) = crate::shutdown::channel();

        let source = Arc::new(source);
        let task = tokio::spawn({
            let source = source.clone();
            async move { source.run(shutdown).await }
        });

        timeout(Duration::from_secs(5), async {
            while store.count_unpublished().unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        trigger.trigger();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_cycle_ingests_whole_window() {
        let macs: Vec<MacAddress> = (0..5u8).map(|i| MacAddress([0x10, 0, 0, 0, 0, i])).collect();
        let (trigger, shutdown) = crate::shutdown::channel();
        let scanner = StoppingScanner {
            inner: FakeScanner::new(vec![Ok(macs
                .iter()
                .map(|mac| sensor_advertisement(*mac, 1000))
                .collect())]),
            trigger,
        };
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let registry = Arc::new(DeviceRegistry::new());
        let broker = FakeBroker::new(ConnectionState::Disconnected);
        let source = source_with(scanner, store.clone(), registry.clone(), broker);

        timeout(Duration::from_secs(5), source.run(shutdown))
            .await
            .unwrap();

        assert_eq!(store.count_unpublished().unwrap(), 5);
        assert_eq!(registry.len(), 5);
    }
}
