//! Signal database: frame id -> signal layout lookup
//!
//! Loaded once at startup from a JSON descriptor artifact and never mutated
//! afterwards, so it can be shared by reference across threads without
//! locking. All structural validation happens here at load time; decoding
//! itself has no error path.

use crate::codec;
use crate::types::{CanFrame, ChannelKey, Result, TelemetryError, MAX_CAN_ID};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// Unsigned integer
    Unsigned,
    /// Signed integer (two's complement)
    Signed,
}

/// A CAN signal definition
///
/// Describes one named physical quantity encoded as a bit field within a
/// frame's payload, with a linear scale (factor, offset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Recording channel key; 0 = decoded but not independently recorded
    #[serde(default)]
    pub channel_key: ChannelKey,
    /// Signed or unsigned raw value
    pub value_type: ValueType,
    /// Bit offset within the packed little-endian payload word
    pub bit_pos: u8,
    /// Field width in bits (1-64)
    pub bit_size: u8,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    #[serde(default)]
    pub offset: f64,
    /// Minimum physical value (descriptive metadata only, never validated)
    #[serde(default)]
    pub minimum: f64,
    /// Maximum physical value (descriptive metadata only, never validated)
    #[serde(default)]
    pub maximum: f64,
    /// Engineering unit (e.g., "km/h", "kWh", "V")
    #[serde(default)]
    pub unit: Option<String>,
}

impl SignalDefinition {
    /// Decode this signal's raw value from a packed payload and scale it.
    pub fn physical_value(&self, payload: u64) -> f64 {
        let raw = match self.value_type {
            ValueType::Unsigned => codec::unsigned_field(payload, self.bit_pos, self.bit_size) as f64,
            ValueType::Signed => codec::signed_field(payload, self.bit_pos, self.bit_size) as f64,
        };
        raw * self.factor + self.offset
    }
}

/// A multiplexer group: signals only present when the selector signal's raw
/// decoded value equals `selector_value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MuxGroup {
    /// Name of the selector signal (a plain signal of the same message)
    pub selector_name: String,
    /// Raw selector value activating this group
    pub selector_value: u64,
    /// Signals active for this selector value, in descriptor order
    pub signals: Vec<SignalDefinition>,
}

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDefinition {
    /// CAN message ID
    pub id: u32,
    /// Message name
    pub name: String,
    /// Always-present signals (including any multiplexer selector)
    #[serde(default)]
    pub signals: Vec<SignalDefinition>,
    /// Multiplexed signal groups
    #[serde(default)]
    pub mux_groups: Vec<MuxGroup>,
}

/// Top-level shape of the JSON descriptor artifact
#[derive(Debug, Deserialize, Serialize)]
struct DescriptorFile {
    messages: Vec<MessageDefinition>,
}

/// The signal database
///
/// Immutable after load. Unknown frame identifiers resolve to an empty
/// signal list; they are not an error.
#[derive(Debug)]
pub struct SignalDatabase {
    messages: HashMap<u32, MessageDefinition>,
}

impl SignalDatabase {
    /// Create an empty database (mainly for tests)
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
        }
    }

    /// Parse and validate a JSON descriptor artifact
    pub fn from_json(text: &str) -> Result<Self> {
        let file: DescriptorFile = serde_json::from_str(text)
            .map_err(|e| TelemetryError::DescriptorParseError(e.to_string()))?;

        let mut db = Self::new();
        for message in file.messages {
            db.add_message(message)?;
        }

        log::info!(
            "Loaded descriptor table: {} messages, {} signals",
            db.messages.len(),
            db.signal_count()
        );
        Ok(db)
    }

    /// Load a descriptor artifact from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Add a validated message definition
    pub fn add_message(&mut self, message: MessageDefinition) -> Result<()> {
        validate_message(&message)?;
        if self.messages.contains_key(&message.id) {
            return Err(TelemetryError::InvalidMessageDefinition(format!(
                "duplicate message id 0x{:X}",
                message.id
            )));
        }
        self.messages.insert(message.id, message);
        Ok(())
    }

    /// Get a message definition by frame identifier
    pub fn message(&self, id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&id)
    }

    /// Resolve the signals active in a frame's payload.
    ///
    /// Plain signals are always active. Each multiplexer group contributes
    /// its signals when the selector's raw unsigned decode equals the
    /// group's selector value. An unknown frame id yields an empty list.
    pub fn resolve_active_signals(&self, frame: &CanFrame) -> Vec<&SignalDefinition> {
        let Some(message) = self.messages.get(&frame.id) else {
            return Vec::new();
        };

        let payload = frame.payload_u64();
        let mut active: Vec<&SignalDefinition> = message.signals.iter().collect();

        for group in &message.mux_groups {
            // The selector is guaranteed by load-time validation to be a
            // plain unsigned signal of this message.
            let selected = message
                .signals
                .iter()
                .find(|s| s.name == group.selector_name)
                .map(|sel| codec::unsigned_field(payload, sel.bit_pos, sel.bit_size))
                == Some(group.selector_value);
            if selected {
                active.extend(group.signals.iter());
            }
        }

        active
    }

    /// Total number of signal definitions, including multiplexed ones
    pub fn signal_count(&self) -> usize {
        self.messages
            .values()
            .map(|m| {
                m.signals.len() + m.mux_groups.iter().map(|g| g.signals.len()).sum::<usize>()
            })
            .sum()
    }

    /// Number of message definitions
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

impl Default for SignalDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_signal(message: &str, signal: &SignalDefinition) -> Result<()> {
    if signal.bit_size == 0 || signal.bit_size > 64 {
        return Err(TelemetryError::InvalidSignalDefinition(format!(
            "{}/{}: bit size {} out of range 1-64",
            message, signal.name, signal.bit_size
        )));
    }
    if signal.bit_pos as u32 + signal.bit_size as u32 > 64 {
        return Err(TelemetryError::InvalidSignalDefinition(format!(
            "{}/{}: field at bit {} width {} exceeds the 64-bit payload",
            message, signal.name, signal.bit_pos, signal.bit_size
        )));
    }
    Ok(())
}

fn validate_message(message: &MessageDefinition) -> Result<()> {
    if message.id > MAX_CAN_ID {
        return Err(TelemetryError::InvalidMessageDefinition(format!(
            "{}: id 0x{:X} exceeds the 29-bit identifier range",
            message.name, message.id
        )));
    }

    for signal in &message.signals {
        validate_signal(&message.name, signal)?;
    }
    for group in &message.mux_groups {
        for signal in &group.signals {
            validate_signal(&message.name, signal)?;
        }
    }

    // At most one selector signal per message, and it must be a plain
    // unsigned signal of the same message.
    let mut selector: Option<&str> = None;
    for group in &message.mux_groups {
        match selector {
            None => selector = Some(&group.selector_name),
            Some(name) if name == group.selector_name => {}
            Some(name) => {
                return Err(TelemetryError::InvalidMessageDefinition(format!(
                    "{}: conflicting selector signals '{}' and '{}'",
                    message.name, name, group.selector_name
                )));
            }
        }
    }
    if let Some(name) = selector {
        let found = message.signals.iter().find(|s| s.name == name);
        match found {
            None => {
                return Err(TelemetryError::InvalidMessageDefinition(format!(
                    "{}: selector signal '{}' is not a plain signal of the message",
                    message.name, name
                )));
            }
            Some(sel) if sel.value_type != ValueType::Unsigned => {
                return Err(TelemetryError::InvalidMessageDefinition(format!(
                    "{}: selector signal '{}' must be unsigned",
                    message.name, name
                )));
            }
            Some(_) => {}
        }
    }

    Ok(())
}
