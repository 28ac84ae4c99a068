pub mod fetch;
pub mod forward;

pub use fetch::FetchFarmMonitoringDataHandler;
pub use forward::ForwardingHandler;
