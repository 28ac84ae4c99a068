// Common types and utilities shared across the monitor

pub mod cadence;
pub mod entity_ids;
pub mod id;
pub mod types;

pub use cadence::{FrequencyUnit, MonitorCadence};
pub use entity_ids::*;
pub use id::Id;
pub use types::UnknownVariant;
