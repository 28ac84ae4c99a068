pub mod base_policy;
pub mod data_source;
pub mod registered_policy;

pub use base_policy::{BasePolicy, DEFAULT_CURRENCY};
pub use data_source::{DataSource, DataSourceKind};
pub use registered_policy::{PolicyStatus, RegisteredPolicy, UnderwritingStatus};
