// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Trigger evaluation and claim rules live in domains and use these traits.
//
// Naming convention: Base* for trait names (e.g., BasePolicySource, BaseDataProvider)

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{DataSourceId, FarmId, PolicyId};
use crate::kernel::jobs::MonitorTarget;

// =============================================================================
// Policy Source Trait (what the worker kernel needs to know about policies)
// =============================================================================

#[async_trait]
pub trait BasePolicySource: Send + Sync {
    /// Registered policies whose status is `active`.
    async fn active_policy_ids(&self) -> Result<Vec<PolicyId>>;

    /// Whether the policy is still `active`. Missing policies are not active.
    async fn is_policy_active(&self, policy_id: PolicyId) -> Result<bool>;

    /// Cadence, farm, and parameters the policy's scheduler runs with.
    async fn monitor_target(&self, policy_id: PolicyId) -> Result<MonitorTarget>;
}

// =============================================================================
// Data Provider Trait (Infrastructure - weather / satellite time series)
// =============================================================================

/// One time-series request for a farm and parameter.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesRequest {
    pub farm_id: FarmId,
    pub data_source_id: DataSourceId,
    pub parameter_name: String,
    /// Provider path for this data source, relative to the provider base URL.
    pub endpoint: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// One point of a provider time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Unix seconds.
    pub dt: i64,
    pub data: f64,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub unit: Option<String>,
}

impl SeriesPoint {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.dt, 0)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeouts, connection failures, 5xx. Worth retrying.
    #[error("data provider unavailable: {0}")]
    Transient(String),

    /// Other 4xx or an undecodable body.
    #[error("data provider rejected request: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait BaseDataProvider: Send + Sync {
    async fn fetch_series(&self, request: &SeriesRequest)
        -> std::result::Result<Vec<SeriesPoint>, ProviderError>;
}
