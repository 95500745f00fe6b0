//! Gateway orchestrator.
//!
//! This module is decoupled from CLI parsing, signal handling and process
//! exit codes so the full lifecycle can be tested with an injected scanner
//! and broker.
//!
//! Lifecycle: open the store, start the broker session, run the scan loop,
//! replay drainer and health reporter until the shutdown signal, then announce
//! offline, close the store and close the broker, in that order.

use crate::broker::{Broker, BrokerConfig, MqttBroker, TransportError};
use crate::config::{ConfigError, Options};
use crate::drainer::{DrainSettings, ReplayDrainer};
use crate::health::{HealthReporter, HealthSettings};
use crate::publisher::TelemetryPublisher;
use crate::registry::DeviceRegistry;
use crate::scanner::{ScanError, ScanSettings, ScanSource, Scanner, default_scanner};
use crate::shutdown;
use crate::store::{StorageError, TelemetryStore};
use crate::topics::Topics;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Startup failures. Once the loops are running nothing is fatal.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Per-loop settings derived from [`Options`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub scan: ScanSettings,
    pub drain: DrainSettings,
    pub health: HealthSettings,
}

impl Settings {
    pub fn from_options(options: &Options) -> Self {
        Self {
            scan: ScanSettings {
                window: options.scan_window,
                failure_backoff: options.scan_backoff,
                store_timeout: options.store_timeout,
            },
            drain: DrainSettings {
                interval: options.drain_interval,
                batch_size: options.batch_size,
                pacing: options.publish_pacing,
                retention: options.retention,
                store_timeout: options.store_timeout,
            },
            health: HealthSettings {
                interval: options.health_interval,
                backlog_warn: options.backlog_warn,
                store_timeout: options.store_timeout,
            },
        }
    }
}

/// The running components, each shared with its loop task.
pub struct Gateway {
    store: Arc<TelemetryStore>,
    broker: Arc<dyn Broker>,
    scan: Arc<ScanSource>,
    drainer: Arc<ReplayDrainer>,
    health: Arc<HealthReporter>,
}

impl Gateway {
    pub fn new(
        store: Arc<TelemetryStore>,
        broker: Arc<dyn Broker>,
        scanner: Arc<dyn Scanner>,
        topics: Topics,
        gateway_id: &str,
        settings: Settings,
        started: Instant,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let publisher = TelemetryPublisher::new(broker.clone(), topics, gateway_id);

        Self {
            scan: Arc::new(ScanSource::new(
                scanner,
                store.clone(),
                registry.clone(),
                publisher.clone(),
                settings.scan,
            )),
            drainer: Arc::new(ReplayDrainer::new(
                store.clone(),
                publisher.clone(),
                settings.drain,
            )),
            health: Arc::new(HealthReporter::new(
                store.clone(),
                registry,
                publisher,
                started,
                settings.health,
            )),
            store,
            broker,
        }
    }

    /// Run the three loops until `signal` resolves, then wait for all of
    /// them to observe the shutdown flag.
    pub async fn run_until(&self, signal: impl Future<Output = ()>) {
        let (trigger, shutdown) = shutdown::channel();
        let mut tasks = JoinSet::new();

        let scan = self.scan.clone();
        let rx = shutdown.clone();
        tasks.spawn(async move { scan.run(rx).await });

        let drainer = self.drainer.clone();
        let rx = shutdown.clone();
        tasks.spawn(async move { drainer.run(rx).await });

        let health = self.health.clone();
        tasks.spawn(async move { health.run(shutdown).await });

        signal.await;
        info!("Shutdown requested");
        trigger.trigger();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }

    /// Announce offline (best effort), then release the store and the broker.
    pub async fn shutdown(&self) {
        if self.broker.state().is_connected()
            && let Err(e) = self.health.announce_offline().await
        {
            warn!(error = %e, "Failed to publish offline status");
        }

        match self.store.close() {
            Ok(()) => info!("Telemetry store closed"),
            Err(e) => warn!(error = %e, "Failed to close telemetry store"),
        }

        self.broker.close().await;
    }
}

/// Start the gateway from `options` and run it until `signal` resolves.
///
/// Configuration, store and broker setup errors are returned before any loop
/// starts. Resources acquired before a failure are released.
pub async fn run(options: Options, signal: impl Future<Output = ()>) -> Result<(), RunError> {
    options.validate()?;
    let tls = options.load_tls()?;
    let gateway_id = options.resolve_gateway_id();
    let topics = Topics::new(&options.building_id, &gateway_id);
    let settings = Settings::from_options(&options);
    let scanner = default_scanner()?;
    let started = Instant::now();

    let store = Arc::new(TelemetryStore::open(&options.buffer_path)?);
    match store.count_unpublished() {
        Ok(backlog) => info!(
            path = %options.buffer_path.display(),
            backlog,
            "Telemetry store opened"
        ),
        Err(e) => warn!(error = %e, "Failed to count buffered readings"),
    }

    let broker = MqttBroker::start(BrokerConfig {
        client_id: gateway_id.clone(),
        host: options.mqtt_host.clone(),
        port: options.mqtt_port,
        keep_alive: options.keep_alive,
        tls,
        publish_timeout: options.publish_timeout,
        reconnect_seed: options.reconnect_min,
        reconnect_ceiling: options.reconnect_max,
        topics: topics.clone(),
        started,
    });
    let broker = match broker {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            if let Err(close_err) = store.close() {
                warn!(error = %close_err, "Failed to close telemetry store");
            }
            return Err(e.into());
        }
    };

    info!(
        gateway_id = %gateway_id,
        building_id = %options.building_id,
        version = crate::payload::GATEWAY_VERSION,
        "Gateway started"
    );

    let gateway = Gateway::new(store, broker, scanner, topics, &gateway_id, settings, started);
    gateway.run_until(signal).await;
    gateway.shutdown().await;

    info!("Gateway stopped");
    Ok(())
}
