pub mod activities;
pub mod models;
pub mod store;

pub use activities::{FetchFarmMonitoringDataHandler, ForwardingHandler};
pub use models::{DataQuality, FarmMonitoringData};
pub use store::{MonitoringStore, PostgresMonitoringStore};
