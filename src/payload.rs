//! JSON payloads published to the broker.

use crate::reading::Reading;
use serde::Serialize;

/// Schema version of the telemetry payload.
pub const TELEMETRY_VERSION: &str = "1.0";

/// Gateway software version reported in status payloads.
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Telemetry message for one reading.
///
/// ```json
/// {"version":"1.0","gateway_id":"gateway-12345678","device_id":"aabbccddeeff",
///  "timestamp":1767225600,"received_at":1767225601,
///  "sensor_data":{"co2_ppm":1350,"temperature_c":28.5,"humidity_rh":45.3,
///                 "occupancy":true,"battery_mv":2300},
///  "metadata":{"rssi":-67,"latency_ms":1000}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryPayload<'a> {
    pub version: &'static str,
    pub gateway_id: &'a str,
    pub device_id: &'a str,
    pub timestamp: u32,
    pub received_at: i64,
    pub sensor_data: SensorData,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorData {
    pub co2_ppm: u16,
    pub temperature_c: f32,
    pub humidity_rh: f32,
    pub occupancy: bool,
    pub battery_mv: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    pub rssi: Option<i16>,
    pub latency_ms: i64,
}

impl<'a> TelemetryPayload<'a> {
    pub fn new(gateway_id: &'a str, reading: &'a Reading) -> Self {
        Self {
            version: TELEMETRY_VERSION,
            gateway_id,
            device_id: &reading.device_id,
            timestamp: reading.sample_timestamp,
            received_at: reading.received_at,
            sensor_data: SensorData {
                co2_ppm: reading.co2_ppm,
                temperature_c: reading.temperature_c,
                humidity_rh: reading.humidity_rh,
                occupancy: reading.occupancy,
                battery_mv: reading.battery_mv,
            },
            metadata: Metadata {
                rssi: reading.signal_strength,
                latency_ms: reading.latency_ms(),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Online,
    Offline,
}

/// `buffered_messages` value reported when the store cannot be read.
pub const BACKLOG_UNKNOWN: i64 = -1;

/// Retained gateway status message.
///
/// Announcements sent on connect and shutdown carry only the fields known
/// to the sender; the periodic health report fills in all of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusPayload {
    pub status: GatewayStatus,
    pub timestamp: i64,
    pub version: &'static str,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_devices: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffered_messages: Option<i64>,
}

impl StatusPayload {
    pub fn announcement(status: GatewayStatus, timestamp: i64, uptime_seconds: u64) -> Self {
        Self {
            status,
            timestamp,
            version: GATEWAY_VERSION,
            uptime_seconds,
            mqtt_connected: None,
            active_devices: None,
            buffered_messages: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
