//! Signal descriptor table handling
//!
//! The descriptor table is a static, vehicle-specific artifact produced
//! offline from a network description file. It maps frame identifiers to
//! signal layouts, including multiplexed alternatives.

pub mod database;
pub mod model3;

pub use database::{
    MessageDefinition, MuxGroup, SignalDatabase, SignalDefinition, ValueType,
};
