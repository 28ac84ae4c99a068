//! Typed id aliases for every persisted entity the monitor touches.

pub use super::id::Id;

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker for registered (farmer-bound) policies.
pub struct RegisteredPolicy;

/// Marker for base policy products.
pub struct BasePolicy;

pub struct Trigger;

pub struct TriggerCondition;

pub struct Farm;

pub struct DataSource;

pub struct MonitoringRecord;

pub struct Claim;

pub struct Payout;

pub struct EvaluationLog;

/// Marker for rows in `worker_job_execution`.
pub struct JobExecution;

// ============================================================================
// Type aliases
// ============================================================================

pub type PolicyId = Id<RegisteredPolicy>;
pub type BasePolicyId = Id<BasePolicy>;
pub type TriggerId = Id<Trigger>;
pub type ConditionId = Id<TriggerCondition>;
pub type FarmId = Id<Farm>;
pub type DataSourceId = Id<DataSource>;
pub type MonitoringRecordId = Id<MonitoringRecord>;
pub type ClaimId = Id<Claim>;
pub type PayoutId = Id<Payout>;
pub type EvaluationLogId = Id<EvaluationLog>;
pub type JobExecutionId = Id<JobExecution>;
