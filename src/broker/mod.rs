//! Secured publish/subscribe session with the telemetry broker.
//!
//! The connection task is the only writer of [`ConnectionState`]; every
//! other component holds a `watch` receiver and observes transitions without
//! touching the network.

pub mod backoff;
pub mod mqtt;

pub use backoff::Backoff;
pub use mqtt::{BrokerConfig, MqttBroker, TlsMaterial};
pub use rumqttc::QoS;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Connectivity of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Errors returned by publish operations.
///
/// A failed publish leaves the record unpublished; retrying is always safe.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Broker not connected")]
    NotConnected,
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Boxed future returned by [`Broker::publish`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// Boxed future returned by [`Broker::close`].
pub type CloseFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Broker abstraction so the loops can be tested without a network.
pub trait Broker: Send + Sync {
    /// Receiver that observes every connectivity transition.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Publish a message. Fails when not connected or after the publish timeout.
    fn publish(&self, topic: String, payload: Vec<u8>, qos: QoS, retain: bool)
    -> PublishFuture<'_>;

    /// Flush queued messages, disconnect and stop reconnecting.
    fn close(&self) -> CloseFuture<'_>;

    /// Current connectivity.
    fn state(&self) -> ConnectionState {
        *self.watch_state().borrow()
    }
}
