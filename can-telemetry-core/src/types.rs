//! Core types for the telemetry pipeline
//!
//! This module defines the fundamental types shared by the codec, the signal
//! database and the sampling engine: raw CAN frames as read from the bus,
//! recording channel keys, and the per-window records handed to storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type used throughout the collector
pub type Timestamp = DateTime<Utc>;

/// Result type for descriptor and pipeline operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Largest valid CAN identifier (29-bit extended range)
pub const MAX_CAN_ID: u32 = 0x1FFF_FFFF;

/// Raw CAN frame as read from the bus
///
/// One broadcast message: an identifier plus up to 8 bytes of payload.
/// The capture timestamp is delivered separately by the frame source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN message ID (11-bit or 29-bit)
    pub id: u32,
    /// Frame data bytes (0-8 bytes)
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Create a frame from an identifier and payload bytes.
    ///
    /// The identifier is masked to the 29-bit range; payloads longer than
    /// 8 bytes are truncated.
    pub fn new(id: u32, data: impl Into<Vec<u8>>) -> Self {
        let mut data = data.into();
        data.truncate(8);
        Self {
            id: id & MAX_CAN_ID,
            data,
        }
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Pack the payload into a little-endian `u64`, zero-padded to 8 bytes.
    ///
    /// All signal bit positions in the descriptor table refer to this
    /// packed representation.
    pub fn payload_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..self.data.len()].copy_from_slice(&self.data);
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}({})", self.id, self.data.len())?;
        for b in &self.data {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Errors that can occur while loading the signal descriptor table
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to parse descriptor table: {0}")]
    DescriptorParseError(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Invalid message definition: {0}")]
    InvalidMessageDefinition(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Stable recording key under which aggregated physical values are persisted
///
/// Distinct from the transient signal that produced a value: several signals
/// can feed the same channel over time, and derived channels (battery power,
/// consumption, state of charge) have no backing signal at all. Key `0`
/// marks a signal that is decoded but not independently recorded, such as a
/// multiplexer selector.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelKey(pub u16);

impl ChannelKey {
    pub const NONE: ChannelKey = ChannelKey(0);

    pub const CELL_TEMP_MIN: ChannelKey = ChannelKey(1);
    pub const CELL_TEMP_MID: ChannelKey = ChannelKey(2);
    pub const CELL_TEMP_MAX: ChannelKey = ChannelKey(3);
    pub const CELL_VOLT_MIN: ChannelKey = ChannelKey(5);
    pub const CELL_VOLT_MID: ChannelKey = ChannelKey(6);
    pub const CELL_VOLT_MAX: ChannelKey = ChannelKey(7);
    pub const AC_CHARGE_TOTAL: ChannelKey = ChannelKey(9);
    pub const DC_CHARGE_TOTAL: ChannelKey = ChannelKey(11);
    pub const CHARGE_TOTAL: ChannelKey = ChannelKey(13);
    pub const REGEN_TOTAL: ChannelKey = ChannelKey(16);
    pub const DISCHARGE_TOTAL: ChannelKey = ChannelKey(20);
    pub const SOC: ChannelKey = ChannelKey(23);
    pub const SOC_UI: ChannelKey = ChannelKey(24);
    pub const SOC_MIN: ChannelKey = ChannelKey(25);
    pub const ODOMETER: ChannelKey = ChannelKey(26);
    pub const MAX_DISCHARGE_POWER: ChannelKey = ChannelKey(29);
    pub const BATTERY_VOLTAGE: ChannelKey = ChannelKey(30);
    pub const BATTERY_POWER: ChannelKey = ChannelKey(43);
    pub const BATTERY_CURRENT: ChannelKey = ChannelKey(44);
    pub const OUTSIDE_TEMP_FILTERED: ChannelKey = ChannelKey(59);
    pub const OUTSIDE_TEMP: ChannelKey = ChannelKey(61);
    pub const BATTERY_INLET: ChannelKey = ChannelKey(64);
    pub const RADIATOR_BYPASS: ChannelKey = ChannelKey(69);
    pub const NOMINAL_FULL_PACK: ChannelKey = ChannelKey(71);
    pub const NOMINAL_REMAINING: ChannelKey = ChannelKey(72);
    pub const EXPECTED_REMAINING: ChannelKey = ChannelKey(74);
    pub const IDEAL_REMAINING: ChannelKey = ChannelKey(75);
    pub const PT_INLET: ChannelKey = ChannelKey(80);
    pub const ENERGY_BUFFER: ChannelKey = ChannelKey(87);
    pub const CELL_TEMP_MIN_NUM: ChannelKey = ChannelKey(90);
    pub const CELL_TEMP_MAX_NUM: ChannelKey = ChannelKey(91);
    pub const CELL_VOLT_MIN_NUM: ChannelKey = ChannelKey(92);
    pub const CELL_VOLT_MAX_NUM: ChannelKey = ChannelKey(93);
    pub const FRONT_TORQUE: ChannelKey = ChannelKey(400);
    pub const REAR_TORQUE: ChannelKey = ChannelKey(403);
    pub const ACCEL_PEDAL: ChannelKey = ChannelKey(404);
    pub const FRONT_POWER: ChannelKey = ChannelKey(405);
    pub const REAR_POWER: ChannelKey = ChannelKey(415);
    pub const CONSUMPTION: ChannelKey = ChannelKey(426);
    pub const REAR_STATOR_TEMP: ChannelKey = ChannelKey(429);
    pub const SPEED: ChannelKey = ChannelKey(442);
    pub const FRONT_STATOR_TEMP: ChannelKey = ChannelKey(443);
    pub const POWERTRAIN_FLOW: ChannelKey = ChannelKey(444);
    pub const BATTERY_FLOW: ChannelKey = ChannelKey(445);

    /// First key of the contiguous per-cell voltage range
    pub const CELL_VOLTAGE_FIRST: ChannelKey = ChannelKey(500);

    /// Number of battery cell voltage channels
    pub const CELL_COUNT: u16 = 108;

    /// Key of the i-th battery cell voltage channel
    pub fn cell_voltage(index: u16) -> ChannelKey {
        debug_assert!(index < Self::CELL_COUNT);
        ChannelKey(Self::CELL_VOLTAGE_FIRST.0 + index)
    }

    /// True if values on this key are recorded independently
    pub fn is_recordable(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One aggregated value emitted at a window boundary
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Canonical batch timestamp (short-window grid)
    pub timestamp: Timestamp,
    /// Recording channel
    pub channel: ChannelKey,
    /// Aggregated physical value
    pub value: f64,
}

/// Ordered set of records emitted at one window boundary, never empty
/// when enqueued
pub type Batch = Vec<Record>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_packing_pads_short_frames() {
        let frame = CanFrame::new(0x123, vec![0x10, 0x27]);
        assert_eq!(frame.dlc(), 2);
        assert_eq!(frame.payload_u64(), 0x2710);
    }

    #[test]
    fn test_payload_packing_full_frame() {
        let frame = CanFrame::new(0x123, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(frame.payload_u64(), 0x0807060504030201);
    }

    #[test]
    fn test_id_masked_to_extended_range() {
        let frame = CanFrame::new(0xFFFF_FFFF, vec![]);
        assert_eq!(frame.id, MAX_CAN_ID);
    }

    #[test]
    fn test_frame_display() {
        let frame = CanFrame::new(0x3D2, vec![0x10, 0x27]);
        assert_eq!(frame.to_string(), "3D2(2)1027");
    }

    #[test]
    fn test_cell_voltage_keys_are_contiguous() {
        assert_eq!(ChannelKey::cell_voltage(0), ChannelKey(500));
        assert_eq!(ChannelKey::cell_voltage(107), ChannelKey(607));
    }
}
