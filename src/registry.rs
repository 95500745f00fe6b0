//! In-memory registry of sensors heard by this gateway.
//!
//! The registry is rebuilt from scratch on restart and only feeds status
//! reporting and duplicate suppression; it is never authoritative for
//! delivery. Sensors re-broadcast the same sample every second until they
//! take a new one, so each device remembers the last sample committed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceEntry {
    last_seen_at: i64,
    /// Only set once the sample is safely buffered
    last_sample: Option<u32>,
}

/// Outcome of observing a decoded reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Sample not yet committed for the device
    New,
    /// Re-broadcast of the sample most recently committed
    Repeat,
}

/// Thread-safe `device_id -> last_seen_at` map.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceEntry>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `device_id` was heard at `now` carrying `sample_timestamp`.
    ///
    /// Only `last_seen_at` changes here. A `New` sample stays `New` on its
    /// re-broadcasts until [`commit_sample`](Self::commit_sample) is called.
    pub fn observe(&self, device_id: &str, sample_timestamp: u32, now: i64) -> Observation {
        let mut devices = self.lock();
        let entry = devices.entry(device_id.to_string()).or_insert(DeviceEntry {
            last_seen_at: now,
            last_sample: None,
        });
        entry.last_seen_at = now;

        if entry.last_sample == Some(sample_timestamp) {
            Observation::Repeat
        } else {
            Observation::New
        }
    }

    /// Mark `sample_timestamp` as ingested, so later re-broadcasts are
    /// reported as [`Observation::Repeat`].
    pub fn commit_sample(&self, device_id: &str, sample_timestamp: u32) {
        if let Some(entry) = self.lock().get_mut(device_id) {
            entry.last_sample = Some(sample_timestamp);
        }
    }

    /// Gateway time the device was last heard.
    pub fn last_seen(&self, device_id: &str) -> Option<i64> {
        self.lock().get(device_id).map(|e| e.last_seen_at)
    }

    /// Number of devices heard since startup.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
