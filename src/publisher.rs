//! Serialization and addressing of outbound messages.

use crate::broker::{Broker, ConnectionState, QoS, TransportError};
use crate::payload::{StatusPayload, TelemetryPayload};
use crate::reading::Reading;
use crate::topics::Topics;
use std::sync::Arc;
use tokio::sync::watch;

/// Broker handle bound to one gateway's identity and topic namespace.
#[derive(Clone)]
pub struct TelemetryPublisher {
    broker: Arc<dyn Broker>,
    topics: Topics,
    gateway_id: String,
}

impl TelemetryPublisher {
    pub fn new(broker: Arc<dyn Broker>, topics: Topics, gateway_id: impl Into<String>) -> Self {
        Self {
            broker,
            topics,
            gateway_id: gateway_id.into(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.broker.state().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.broker.watch_state()
    }

    /// Publish one reading to its device topic, QoS 1, not retained.
    pub async fn publish_reading(&self, reading: &Reading) -> Result<(), TransportError> {
        let payload = TelemetryPayload::new(&self.gateway_id, reading).to_json()?;
        self.broker
            .publish(
                self.topics.telemetry(&reading.device_id),
                payload,
                QoS::AtLeastOnce,
                false,
            )
            .await
    }

    /// Publish a retained status message, QoS 1.
    pub async fn publish_status(&self, status: &StatusPayload) -> Result<(), TransportError> {
        let payload = status.to_json()?;
        self.broker
            .publish(
                self.topics.status().to_string(),
                payload,
                QoS::AtLeastOnce,
                true,
            )
            .await
    }
}
