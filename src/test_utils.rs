use crate::broker::{Broker, CloseFuture, ConnectionState, PublishFuture, QoS, TransportError};
use crate::codec::{Frame, MANUFACTURER_ID, encode_frame};
use crate::mac_address::MacAddress;
use crate::reading::{Advertisement, Reading};
use crate::scanner::{ScanError, ScanFuture, Scanner};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Advertisement carrying `data` under the sensor manufacturer id.
pub fn advertisement(mac: MacAddress, data: Vec<u8>) -> Advertisement {
    Advertisement {
        mac,
        manufacturer_id: MANUFACTURER_ID,
        data,
        rssi: Some(-67),
    }
}

/// Valid encoded advertisement for `sample_timestamp`.
pub fn sensor_advertisement(mac: MacAddress, sample_timestamp: u32) -> Advertisement {
    let frame = Frame {
        co2_ppm: 850,
        temperature_c: 22.5,
        humidity_rh: 41.0,
        occupancy: true,
        sample_timestamp,
        battery_mv: 2900,
    };
    advertisement(mac, encode_frame(&frame).to_vec())
}

/// Reading received one second after it was sampled.
///
/// Tests can override just the fields they care about.
pub fn reading(device_id: &str, sample_timestamp: u32) -> Reading {
    Reading {
        device_id: device_id.to_string(),
        co2_ppm: 850,
        temperature_c: 22.5,
        humidity_rh: 41.0,
        occupancy: false,
        sample_timestamp,
        battery_mv: 2900,
        signal_strength: Some(-67),
        received_at: i64::from(sample_timestamp) + 1,
    }
}

/// Scanner replaying scripted cycles, then reporting nothing.
#[derive(Default)]
pub struct FakeScanner {
    cycles: Mutex<VecDeque<Result<Vec<Advertisement>, ScanError>>>,
    pub scans: AtomicUsize,
}

impl FakeScanner {
    pub fn new(cycles: Vec<Result<Vec<Advertisement>, ScanError>>) -> Self {
        Self {
            cycles: Mutex::new(cycles.into()),
            scans: AtomicUsize::new(0),
        }
    }
}

impl Scanner for FakeScanner {
    fn scan(&self, window: Duration) -> ScanFuture<'_> {
        Box::pin(async move {
            self.scans.fetch_add(1, Ordering::SeqCst);
            let next = self.cycles.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => {
                    tokio::time::sleep(window).await;
                    Ok(Vec::new())
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

/// In-memory broker recording every accepted publish.
pub struct FakeBroker {
    state: watch::Sender<ConnectionState>,
    published: Mutex<Vec<Published>>,
    /// Publishes still allowed before the fake link drops.
    budget: Mutex<Option<usize>>,
    pub closed: AtomicBool,
}

impl FakeBroker {
    pub fn new(state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state: watch::Sender::new(state),
            published: Mutex::new(Vec::new()),
            budget: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Accept `n` more publishes, then drop to disconnected.
    pub fn disconnect_after(&self, n: usize) {
        *self.budget.lock().unwrap() = Some(n);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn on_topic(&self, suffix: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic.ends_with(suffix))
            .collect()
    }
}

impl Broker for FakeBroker {
    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
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
            {
                let mut budget = self.budget.lock().unwrap();
                match budget.as_mut() {
                    Some(0) => {
                        self.state.send_replace(ConnectionState::Disconnected);
                        return Err(TransportError::NotConnected);
                    }
                    Some(n) => *n -= 1,
                    None => {}
                }
            }
            self.published.lock().unwrap().push(Published {
                topic,
                payload,
                qos,
                retain,
            });
            Ok(())
        })
    }

    fn close(&self) -> CloseFuture<'_> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.state.send_replace(ConnectionState::Disconnected);
        })
    }
}
