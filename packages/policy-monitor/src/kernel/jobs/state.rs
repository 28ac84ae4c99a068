//! Persisted pool and scheduler state, plus the per-policy monitoring target
//! both are built from.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::job::MonitoredParameter;
use crate::closed_enum;
use crate::common::{BasePolicyId, FarmId, FrequencyUnit, MonitorCadence, PolicyId};

closed_enum! {
    /// Lifecycle shared by worker pools and schedulers:
    /// created -> active -> stopped -> archived.
    pub enum LifecycleStatus as "lifecycle status" {
        Created => "created",
        Active => "active",
        Stopped => "stopped",
        Archived => "archived",
    }
}

impl LifecycleStatus {
    /// Whether `self -> next` is allowed. Re-activating a stopped pool (and
    /// an `active` row left behind by a crash) is how recovery resumes; nothing
    /// reaches `archived` without passing through `stopped`.
    pub fn can_transition_to(&self, next: LifecycleStatus) -> bool {
        use LifecycleStatus::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Active, Active)
                | (Stopped, Active)
                | (Created, Stopped)
                | (Active, Stopped)
                | (Stopped, Stopped)
                | (Stopped, Archived)
        )
    }
}

// ============================================================================
// Naming
// ============================================================================

pub fn pool_name(policy_id: PolicyId) -> String {
    format!("policy-{}-pool", policy_id)
}

pub fn queue_name_base(policy_id: PolicyId) -> String {
    format!("policy-{}", policy_id)
}

pub fn scheduler_name(policy_id: PolicyId) -> String {
    format!("policy-{}-scheduler", policy_id)
}

fn duration_to_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn nanos_to_duration(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}

// ============================================================================
// Rows
// ============================================================================

/// Row of `worker_pool_state`. `job_timeout` is stored in nanoseconds.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolState {
    pub policy_id: PolicyId,
    pub pool_name: String,
    pub queue_name_base: String,
    pub num_workers: i32,
    pub job_timeout: i64,
    pub pool_status: LifecycleStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_job_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl WorkerPoolState {
    pub fn new(target: &MonitorTarget, num_workers: usize, job_timeout: Duration) -> Self {
        Self {
            policy_id: target.policy_id,
            pool_name: pool_name(target.policy_id),
            queue_name_base: queue_name_base(target.policy_id),
            num_workers: i32::try_from(num_workers).unwrap_or(i32::MAX),
            job_timeout: duration_to_nanos(job_timeout),
            pool_status: LifecycleStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_job_at: None,
            metadata: target.metadata(),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        nanos_to_duration(self.job_timeout)
    }

    pub fn worker_count(&self) -> usize {
        usize::try_from(self.num_workers).unwrap_or(1).max(1)
    }
}

/// Row of `worker_scheduler_state`. `monitor_interval` is stored in
/// nanoseconds; `monitor_frequency_unit` keeps the trigger's original unit.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSchedulerState {
    pub policy_id: PolicyId,
    pub scheduler_name: String,
    pub monitor_interval: i64,
    pub monitor_frequency_unit: FrequencyUnit,
    pub scheduler_status: LifecycleStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub metadata: serde_json::Value,
}

impl WorkerSchedulerState {
    pub fn new(target: &MonitorTarget) -> Self {
        Self {
            policy_id: target.policy_id,
            scheduler_name: scheduler_name(target.policy_id),
            monitor_interval: duration_to_nanos(target.cadence.to_duration()),
            monitor_frequency_unit: target.cadence.unit,
            scheduler_status: LifecycleStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            metadata: target.metadata(),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        nanos_to_duration(self.monitor_interval)
    }
}

// ============================================================================
// Monitoring target
// ============================================================================

/// Everything a policy's pool and scheduler need to run.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct MonitorTarget {
    pub policy_id: PolicyId,
    pub base_policy_id: BasePolicyId,
    pub farm_id: FarmId,
    pub cadence: MonitorCadence,
    #[builder(default)]
    pub parameters: Vec<MonitoredParameter>,
    #[builder(default = 1)]
    pub lookback_days: i32,
}

impl MonitorTarget {
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "base_policy_id": self.base_policy_id,
            "farm_id": self.farm_id,
        })
    }
}
