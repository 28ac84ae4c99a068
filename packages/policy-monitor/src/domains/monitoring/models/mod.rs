pub mod farm_monitoring_data;

pub use farm_monitoring_data::{DataQuality, FarmMonitoringData};
