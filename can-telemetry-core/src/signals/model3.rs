//! Embedded Model 3 descriptor table
//!
//! The table is compiled offline from the vehicle's network description and
//! shipped as a JSON artifact embedded in the binary, so the collector needs
//! no files at runtime. The per-brick voltage message is generated in code:
//! its 36 multiplexer groups are identical up to cell numbering and would
//! only bloat the artifact.

use crate::types::{ChannelKey, Result};

use super::database::{
    MessageDefinition, MuxGroup, SignalDatabase, SignalDefinition, ValueType,
};

static MODEL3_JSON: &str = include_str!("model3.json");

/// CAN id of the multiplexed per-brick voltage message
pub const BRICK_VOLTAGE_ID: u32 = 0x401;

/// Brick voltage cells carried per multiplexer group
const CELLS_PER_GROUP: u16 = 3;

/// Load the Model 3 signal database.
pub fn model3() -> Result<SignalDatabase> {
    let mut db = SignalDatabase::from_json(MODEL3_JSON)?;
    db.add_message(brick_voltages())?;
    Ok(db)
}

/// Build the multiplexed brick voltage message: selector byte 0 picks which
/// three consecutive cells the remaining payload carries.
fn brick_voltages() -> MessageDefinition {
    let selector = SignalDefinition {
        name: "BrickVoltageIndex".to_string(),
        channel_key: ChannelKey::NONE,
        value_type: ValueType::Unsigned,
        bit_pos: 0,
        bit_size: 8,
        factor: 1.0,
        offset: 0.0,
        minimum: 0.0,
        maximum: (ChannelKey::CELL_COUNT / CELLS_PER_GROUP - 1) as f64,
        unit: None,
    };

    let mux_groups = (0..ChannelKey::CELL_COUNT / CELLS_PER_GROUP)
        .map(|group| MuxGroup {
            selector_name: selector.name.clone(),
            selector_value: group as u64,
            signals: (0..CELLS_PER_GROUP)
                .map(|slot| {
                    let cell = group * CELLS_PER_GROUP + slot;
                    SignalDefinition {
                        name: format!("BrickVoltage{cell}"),
                        channel_key: ChannelKey::cell_voltage(cell),
                        value_type: ValueType::Unsigned,
                        bit_pos: 8 + slot as u8 * 14,
                        bit_size: 14,
                        factor: 0.000305,
                        offset: 0.0,
                        minimum: 0.0,
                        maximum: 5.0,
                        unit: Some("V".to_string()),
                    }
                })
                .collect(),
        })
        .collect();

    MessageDefinition {
        id: BRICK_VOLTAGE_ID,
        name: "BrickVoltages".to_string(),
        signals: vec![selector],
        mux_groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CanFrame;

    #[test]
    fn test_model3_table_loads() {
        let db = model3().unwrap();
        assert_eq!(db.message_count(), 14);
        // 36 groups of 3 cells plus the selector
        let brick = db.message(BRICK_VOLTAGE_ID).unwrap();
        assert_eq!(brick.mux_groups.len(), 36);
        assert_eq!(brick.signals.len(), 1);
    }

    #[test]
    fn test_cell_minmax_mux_selection() {
        let db = model3().unwrap();

        let frame = CanFrame::new(0x332, vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let mut names: Vec<_> = db
            .resolve_active_signals(&frame)
            .iter()
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "BattCellMultiplexer",
                "BattCellTempMax",
                "BattCellTempMaxNum",
                "BattCellTempMin",
                "BattCellTempMinNum",
            ]
        );

        let frame = CanFrame::new(0x332, vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let mut names: Vec<_> = db
            .resolve_active_signals(&frame)
            .iter()
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "BattCellBrickVoltageMax",
                "BattCellBrickVoltageMaxNum",
                "BattCellBrickVoltageMin",
                "BattCellBrickVoltageMinNum",
                "BattCellMultiplexer",
            ]
        );
    }

    #[test]
    fn test_charge_discharge_signals() {
        let db = model3().unwrap();
        let frame = CanFrame::new(0x3D2, vec![0x00; 8]);
        let names: Vec<_> = db
            .resolve_active_signals(&frame)
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["TotalDischargeKWh", "TotalChargeKWh"]);
    }

    #[test]
    fn test_brick_voltage_group_layout() {
        let db = model3().unwrap();
        // Selector 5 carries cells 15, 16, 17
        let frame = CanFrame::new(BRICK_VOLTAGE_ID, vec![0x05, 0, 0, 0, 0, 0, 0, 0]);
        let active = db.resolve_active_signals(&frame);
        let keys: Vec<_> = active
            .iter()
            .filter(|s| s.channel_key.is_recordable())
            .map(|s| s.channel_key)
            .collect();
        assert_eq!(
            keys,
            vec![
                ChannelKey::cell_voltage(15),
                ChannelKey::cell_voltage(16),
                ChannelKey::cell_voltage(17),
            ]
        );
    }
}
