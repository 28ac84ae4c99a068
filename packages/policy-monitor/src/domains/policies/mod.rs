pub mod catalog;
pub mod models;

pub use catalog::{
    CatalogPolicySource, MonitoringPlan, PolicyCatalog, PostgresPolicyCatalog, TriggerPlan,
};
pub use models::{
    BasePolicy, DataSource, DataSourceKind, PolicyStatus, RegisteredPolicy, UnderwritingStatus,
    DEFAULT_CURRENCY,
};
