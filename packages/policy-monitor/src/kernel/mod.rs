//! Kernel module - worker infrastructure and dependencies.

pub mod data_provider;
pub mod deps;
pub mod jobs;
pub mod scheduled_tasks;
pub mod test_dependencies;
pub mod traits;

pub use data_provider::HttpDataProvider;
pub use deps::{ForwardingEndpoints, MonitorDeps};
pub use scheduled_tasks::{start_scheduler, DEFAULT_CLAIM_SWEEP_CRON, DEFAULT_POLICY_ADOPT_CRON};
pub use test_dependencies::{
    InMemoryClaimStore, InMemoryMonitoringStore, InMemoryPolicyCatalog, MockDataProvider,
    TestDependencies,
};
pub use traits::*;
