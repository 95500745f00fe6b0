//! MQTT broker session over TLS, backed by `rumqttc`.
//!
//! A dedicated task polls the `rumqttc` event loop and owns the connection
//! state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^              |             |
//!      +--------------+-------------+   (connect failure / transport error)
//! ```
//!
//! Every failure waits out the next [`Backoff`] delay before the next attempt.

use super::{Backoff, Broker, CloseFuture, ConnectionState, PublishFuture, QoS, TransportError};
use crate::payload::{GatewayStatus, StatusPayload};
use crate::time::unix_now;
use crate::topics::Topics;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    TlsConfiguration, Transport,
};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Capacity of the request queue between the client handle and the event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// PEM encoded credentials for mutual TLS.
#[derive(Clone)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca", &format_args!("{} bytes", self.ca.len()))
            .field("client_cert", &format_args!("{} bytes", self.client_cert.len()))
            .field("client_key", &"<redacted>")
            .finish()
    }
}

/// Settings for [`MqttBroker::start`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    /// `None` connects over plain TCP
    pub tls: Option<TlsMaterial>,
    pub publish_timeout: Duration,
    pub reconnect_seed: Duration,
    pub reconnect_ceiling: Duration,
    pub topics: Topics,
    /// Process start, for the uptime in the online announcement
    pub started: Instant,
}

impl BrokerConfig {
    fn mqtt_options(&self) -> Result<MqttOptions, TransportError> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        let will = StatusPayload::announcement(GatewayStatus::Offline, unix_now(), 0).to_json()?;
        options.set_last_will(LastWill::new(
            self.topics.status(),
            will,
            QoS::AtLeastOnce,
            true,
        ));

        if let Some(tls) = &self.tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: tls.ca.clone(),
                alpn: None,
                client_auth: Some((tls.client_cert.clone(), tls.client_key.clone())),
            }));
        }

        Ok(options)
    }
}

/// Handle to a running broker session.
#[derive(Debug)]
pub struct MqttBroker {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    publish_timeout: Duration,
}

impl MqttBroker {
    /// Spawn the connection task. Connecting happens in the background;
    /// the returned handle starts out [`ConnectionState::Disconnected`].
    pub fn start(config: BrokerConfig) -> Result<Self, TransportError> {
        let options = config.mqtt_options()?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (stop, stop_rx) = watch::channel(false);

        info!(
            host = %config.host,
            port = config.port,
            tls = config.tls.is_some(),
            "Connecting to MQTT broker"
        );

        let session = Session {
            client: client.clone(),
            state: state_tx,
            backoff: Backoff::new(config.reconnect_seed, config.reconnect_ceiling),
            topics: config.topics,
            started: config.started,
        };
        let task = tokio::spawn(session.run(eventloop, stop_rx));

        Ok(Self {
            client,
            state,
            stop,
            task: Mutex::new(Some(task)),
            publish_timeout: config.publish_timeout,
        })
    }

    /// Disconnect cleanly and stop the connection task.
    ///
    /// Requests queued before the call (such as a final status message) are
    /// flushed first when the session is up. Bounded by the publish timeout.
    pub async fn disconnect(&self) {
        if self.state().is_connected() {
            match timeout(self.publish_timeout, self.client.disconnect()).await {
                Ok(Ok(())) => debug!("Disconnect requested"),
                Ok(Err(e)) => warn!(error = %e, "Failed to request disconnect"),
                Err(_) => warn!("Timed out requesting disconnect"),
            }
        } else {
            self.stop.send_replace(true);
        }

        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return;
        };

        if timeout(self.publish_timeout, &mut handle).await.is_err() {
            warn!("Broker session did not stop in time, cancelling");
            self.stop.send_replace(true);
            let _ = handle.await;
        }
        info!("Broker connection released");
    }
}

impl Broker for MqttBroker {
    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> PublishFuture<'_> {
        Box::pin(async move {
            if !self.state().is_connected() {
                return Err(TransportError::NotConnected);
            }
            timeout(
                self.publish_timeout,
                self.client.publish(topic, qos, retain, payload),
            )
            .await
            .map_err(|_| TransportError::Timeout(self.publish_timeout))??;
            Ok(())
        })
    }

    fn close(&self) -> CloseFuture<'_> {
        Box::pin(self.disconnect())
    }
}

/// State owned by the connection task.
struct Session {
    client: AsyncClient,
    state: watch::Sender<ConnectionState>,
    backoff: Backoff,
    topics: Topics,
    started: Instant,
}

impl Session {
    async fn run(mut self, mut eventloop: EventLoop, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }
            if *self.state.borrow() == ConnectionState::Disconnected {
                self.transition(ConnectionState::Connecting);
            }

            let event = tokio::select! {
                _ = stop.changed() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                    self.on_connected();
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    warn!(code = ?ack.code, "MQTT connection refused");
                    if !self.wait_backoff(&mut stop).await {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == self.topics.ota_request() {
                        info!(
                            topic = %publish.topic,
                            bytes = publish.payload.len(),
                            "OTA request received, no handler installed"
                        );
                    } else {
                        debug!(topic = %publish.topic, "Ignoring inbound message");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from MQTT broker");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let state = *self.state.borrow();
                    warn!(error = %e, %state, "MQTT transport error");
                    if !self.wait_backoff(&mut stop).await {
                        break;
                    }
                }
            }
        }

        self.transition(ConnectionState::Disconnected);
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Broker connection state changed");
        }
    }

    /// Subscribe to the control topic, announce ourselves online, then
    /// flip the state so waiting loops wake up.
    fn on_connected(&mut self) {
        self.backoff.reset();
        info!("Connected to MQTT broker");

        let ota = self.topics.ota_request();
        match self.client.try_subscribe(ota, QoS::AtLeastOnce) {
            Ok(()) => info!(topic = %ota, "Subscribed to OTA topic"),
            Err(e) => warn!(topic = %ota, error = %e, "Failed to subscribe to OTA topic"),
        }

        let uptime = self.started.elapsed().as_secs();
        match StatusPayload::announcement(GatewayStatus::Online, unix_now(), uptime).to_json() {
            Ok(payload) => {
                if let Err(e) =
                    self.client
                        .try_publish(self.topics.status(), QoS::AtLeastOnce, true, payload)
                {
                    warn!(error = %e, "Failed to publish online status");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode online status"),
        }

        self.transition(ConnectionState::Connected);
    }

    /// Mark the session down and sleep. Returns `false` if asked to stop.
    async fn wait_backoff(&mut self, stop: &mut watch::Receiver<bool>) -> bool {
        self.transition(ConnectionState::Disconnected);
        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");

        tokio::select! {
            _ = stop.changed() => false,
            _ = sleep(delay) => true,
        }
    }
}
