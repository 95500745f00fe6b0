//! Decoded sensor sample and its buffered form.

use crate::mac_address::MacAddress;

/// One decoded sample from an air quality sensor.
///
/// Units:
/// - CO2 in parts per million
/// - Temperature in Celsius, one decimal
/// - Relative humidity in percent, one decimal
/// - Battery in millivolts
/// - Signal strength (RSSI) in dBm
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Lower-case hex hardware address without separators
    pub device_id: String,
    pub co2_ppm: u16,
    pub temperature_c: f32,
    pub humidity_rh: f32,
    pub occupancy: bool,
    /// Device clock, seconds since the Unix epoch
    pub sample_timestamp: u32,
    pub battery_mv: u16,
    pub signal_strength: Option<i16>,
    /// Gateway wall clock at ingestion, seconds since the Unix epoch
    pub received_at: i64,
}

impl Reading {
    /// Transport latency in milliseconds as seen by the gateway.
    ///
    /// Negative when the device clock runs ahead of the gateway.
    pub fn latency_ms(&self) -> i64 {
        (self.received_at - i64::from(self.sample_timestamp)) * 1000
    }
}

/// A reading persisted in the telemetry store.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub id: i64,
    pub reading: Reading,
    pub published: bool,
    pub published_at: Option<i64>,
}

/// Raw manufacturer data observed on the wireless medium.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub mac: MacAddress,
    pub manufacturer_id: u16,
    /// Manufacturer-specific bytes with the company id already split off
    pub data: Vec<u8>,
    pub rssi: Option<i16>,
}

#[cfg(test)]
mod tests {
    use crate::test_utils::reading;

    #[test]
    fn test_latency_from_device_and_gateway_clocks() {
        let mut r = reading("aabbccddeeff", 1_700_000_000);
        r.received_at = 1_700_000_002;
        assert_eq!(r.latency_ms(), 2000);
    }

    #[test]
    fn test_latency_negative_under_clock_skew() {
        let mut r = reading("aabbccddeeff", 1_700_000_010);
        r.received_at = 1_700_000_000;
        assert_eq!(r.latency_ms(), -10_000);
    }
}
