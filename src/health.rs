//! Periodic retained status report.

use crate::broker::TransportError;
use crate::payload::{BACKLOG_UNKNOWN, GatewayStatus, StatusPayload};
use crate::publisher::TelemetryPublisher;
use crate::registry::DeviceRegistry;
use crate::shutdown::Shutdown;
use crate::store::TelemetryStore;
use crate::time::unix_now;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    /// Backlog size that triggers a warning; 0 disables it
    pub backlog_warn: u64,
    pub store_timeout: Duration,
}

pub struct HealthReporter {
    store: Arc<TelemetryStore>,
    registry: Arc<DeviceRegistry>,
    publisher: TelemetryPublisher,
    started: Instant,
    settings: HealthSettings,
}

impl HealthReporter {
    pub fn new(
        store: Arc<TelemetryStore>,
        registry: Arc<DeviceRegistry>,
        publisher: TelemetryPublisher,
        started: Instant,
        settings: HealthSettings,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            started,
            settings,
        }
    }

    /// Report, then sleep for the interval, until shutdown.
    pub async fn run(&self, mut shutdown: Shutdown) {
        while !shutdown.is_requested() {
            let status = self.snapshot().await;
            if status.mqtt_connected == Some(true) {
                match self.publisher.publish_status(&status).await {
                    Ok(()) => debug!(
                        devices = status.active_devices,
                        backlog = status.buffered_messages,
                        "Health status published"
                    ),
                    Err(e) => warn!(error = %e, "Failed to publish health status"),
                }
            } else {
                debug!("Broker not connected, skipping health status");
            }

            if !shutdown.sleep(self.settings.interval).await {
                break;
            }
        }
    }

    /// Build a status report from the current component state.
    ///
    /// A store error reports `buffered_messages` as [`BACKLOG_UNKNOWN`]
    /// rather than failing the report.
    pub async fn snapshot(&self) -> StatusPayload {
        let backlog = match self
            .store
            .run_blocking(self.settings.store_timeout, |store| store.count_unpublished())
            .await
        {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Failed to count buffered readings");
                None
            }
        };

        if let Some(count) = backlog
            && self.settings.backlog_warn > 0
            && count >= self.settings.backlog_warn
        {
            warn!(
                backlog = count,
                threshold = self.settings.backlog_warn,
                "Telemetry backlog is growing"
            );
        }

        StatusPayload {
            mqtt_connected: Some(self.publisher.is_connected()),
            active_devices: Some(self.registry.len()),
            buffered_messages: Some(backlog.map_or(BACKLOG_UNKNOWN, |count| {
                i64::try_from(count).unwrap_or(i64::MAX)
            })),
            ..StatusPayload::announcement(
                GatewayStatus::Online,
                unix_now(),
                self.started.elapsed().as_secs(),
            )
        }
    }

    /// Best-effort offline announcement on shutdown.
    pub async fn announce_offline(&self) -> Result<(), TransportError> {
        let status = StatusPayload::announcement(
            GatewayStatus::Offline,
            unix_now(),
            self.started.elapsed().as_secs(),
        );
        self.publisher.publish_status(&status).await?;
        info!("Offline status published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectionState;
    use crate::test_utils::{FakeBroker, reading};
    use crate::topics::Topics;
    use tokio::time::timeout;

    fn reporter(
        broker: Arc<FakeBroker>,
    ) -> (HealthReporter, Arc<TelemetryStore>, Arc<DeviceRegistry>) {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let registry = Arc::new(DeviceRegistry::new());
        let publisher = TelemetryPublisher::new(broker, Topics::new("b1", "gw"), "gw");
        let reporter = HealthReporter::new(
            store.clone(),
            registry.clone(),
            publisher,
            Instant::now(),
            HealthSettings {
                interval: Duration::from_millis(20),
                backlog_warn: 10_000,
                store_timeout: Duration::from_secs(2),
            },
        );
        (reporter, store, registry)
    }

    #[tokio::test]
    async fn test_snapshot_reports_components() {
        let broker = FakeBroker::new(ConnectionState::Connected);
        let (reporter, store, registry) = reporter(broker);
        store.append(&reading("aa", 1)).unwrap();
        store.append(&reading("aa", 2)).unwrap();
        registry.observe("aa", 2, 10);
        registry.observe("bb", 5, 10);
        registry.observe("cc", 5, 10);

        let status = reporter.snapshot().await;

        assert_eq!(status.status, GatewayStatus::Online);
        assert_eq!(status.mqtt_connected, Some(true));
        assert_eq!(status.active_devices, Some(3));
        assert_eq!(status.buffered_messages, Some(2));
    }

    #[tokio::test]
    async fn test_snapshot_survives_closed_store() {
        let broker = FakeBroker::new(ConnectionState::Disconnected);
        let (reporter, store, _) = reporter(broker);
        store.close().unwrap();

        let status = reporter.snapshot().await;

        assert_eq!(status.mqtt_connected, Some(false));
        assert_eq!(status.buffered_messages, Some(BACKLOG_UNKNOWN));
        let body: serde_json::Value = serde_json::from_slice(&status.to_json().unwrap()).unwrap();
        assert_eq!(body["buffered_messages"], -1);
    }

    #[tokio::test]
    async fn test_run_publishes_retained_status_only_when_connected() {
        let broker = FakeBroker::new(ConnectionState::Disconnected);
        let (reporter, _, _) = reporter(broker.clone());
        let (trigger, shutdown) = crate::shutdown::channel();

        let reporter = Arc::new(reporter);
        let task = tokio::spawn({
            let reporter = reporter.clone();
            async move { reporter.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.on_topic("/status").is_empty());

        broker.set_state(ConnectionState::Connected);
        timeout(Duration::from_secs(5), async {
            while broker.on_topic("/status").is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let sent = broker.on_topic("/status").remove(0);
        assert!(sent.retain);
        let body = sent.json();
        assert_eq!(body["status"], "online");
        assert_eq!(body["mqtt_connected"], true);
        assert_eq!(body["buffered_messages"], 0);

        trigger.trigger();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_offline_announcement() {
        let broker = FakeBroker::new(ConnectionState::Connected);
        let (reporter, _, _) = reporter(broker.clone());

        reporter.announce_offline().await.unwrap();

        let body = broker.on_topic("/status")[0].json();
        assert_eq!(body["status"], "offline");
        assert!(body.get("mqtt_connected").is_none());
    }
}
