//! Fixed-layout sensor advertisement frame.
//!
//! Frame layout (little-endian, company id already split off by the BLE stack):
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 0      | 2    | CO2 (ppm, u16)   |
//! | 2      | 4    | temperature (f32)|
//! | 6      | 4    | humidity (f32)   |
//! | 10     | 1    | occupancy (u8)   |
//! | 11     | 4    | timestamp (u32)  |
//! | 15     | 2    | battery (mV, u16)|
//! | 17     | 2    | CRC16 (u16)      |
//! | 19     | 2    | reserved         |
//!
//! The checksum is CRC16-CCITT (poly 0x1021, init 0xFFFF, no reflection)
//! over bytes 0..17. Payloads shorter than [`FRAME_LEN`] are never checked.

use crate::reading::{Advertisement, Reading};
use crc::{CRC_16_IBM_3740, Crc};
use thiserror::Error;

/// Manufacturer id carried by our sensors (the Bluetooth SIG test id).
pub const MANUFACTURER_ID: u16 = 0xFFFF;

/// Minimum payload length, including the checksum and the reserved tail.
pub const FRAME_LEN: usize = 21;

const CHECKSUM_OFFSET: usize = 17;
const CHECKSUM_END: usize = CHECKSUM_OFFSET + 2;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Content validation failure for a frame that claimed to be ours.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Integrity error: received checksum {received:#06x}, computed {computed:#06x}")]
    Integrity { received: u16, computed: u16 },
}

/// `Ok(None)` means the advertisement is foreign traffic or too short to be a frame.
pub type FrameResult = Result<Option<Reading>, FrameError>;

/// Sensor values as they travel on air, before rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub co2_ppm: u16,
    pub temperature_c: f32,
    pub humidity_rh: f32,
    pub occupancy: bool,
    pub sample_timestamp: u32,
    pub battery_mv: u16,
}

/// CRC16-CCITT checksum used by the sensor firmware.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Decode an advertisement into a [`Reading`].
///
/// The checksum is the only content validation; no range checks are applied.
/// Temperature and humidity are rounded to one decimal after the checksum
/// has been verified against the raw bytes.
pub fn decode_frame(advertisement: &Advertisement, received_at: i64) -> FrameResult {
    if advertisement.manufacturer_id != MANUFACTURER_ID {
        return Ok(None);
    }

    let data = advertisement.data.as_slice();
    if data.len() < FRAME_LEN {
        return Ok(None);
    }

    let received = u16::from_le_bytes([data[CHECKSUM_OFFSET], data[CHECKSUM_OFFSET + 1]]);
    let computed = crc16(&data[..CHECKSUM_OFFSET]);
    if received != computed {
        return Err(FrameError::Integrity { received, computed });
    }

    let temperature_c = f32::from_le_bytes([data[2], data[3], data[4], data[5]]);
    let humidity_rh = f32::from_le_bytes([data[6], data[7], data[8], data[9]]);

    Ok(Some(Reading {
        device_id: advertisement.mac.device_id(),
        co2_ppm: u16::from_le_bytes([data[0], data[1]]),
        temperature_c: round_one_decimal(temperature_c),
        humidity_rh: round_one_decimal(humidity_rh),
        occupancy: data[10] != 0,
        sample_timestamp: u32::from_le_bytes([data[11], data[12], data[13], data[14]]),
        battery_mv: u16::from_le_bytes([data[15], data[16]]),
        signal_strength: advertisement.rssi,
        received_at,
    }))
}

/// Encode sensor values into a frame, as the firmware does.
pub fn encode_frame(frame: &Frame) -> [u8; FRAME_LEN] {
    let mut out = [0u8; FRAME_LEN];
    out[0..2].copy_from_slice(&frame.co2_ppm.to_le_bytes());
    out[2..6].copy_from_slice(&frame.temperature_c.to_le_bytes());
    out[6..10].copy_from_slice(&frame.humidity_rh.to_le_bytes());
    out[10] = u8::from(frame.occupancy);
    out[11..15].copy_from_slice(&frame.sample_timestamp.to_le_bytes());
    out[15..17].copy_from_slice(&frame.battery_mv.to_le_bytes());
    let crc = crc16(&out[..CHECKSUM_OFFSET]);
    out[CHECKSUM_OFFSET..CHECKSUM_END].copy_from_slice(&crc.to_le_bytes());
    out
}

fn round_one_decimal(value: f32) -> f32 {
    ((f64::from(value) * 10.0).round() / 10.0) as f32
}
