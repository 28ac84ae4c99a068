// Domain modules: policy catalog, trigger evaluation, measurement
// ingestion, and the claim lifecycle.

pub mod claims;
pub mod monitoring;
pub mod policies;
pub mod triggers;
