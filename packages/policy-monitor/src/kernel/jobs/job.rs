//! Job model: payloads travelling through pool queues and the persisted
//! execution history that tracks them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::closed_enum;
use crate::common::{BasePolicyId, DataSourceId, FarmId, JobExecutionId, PolicyId};

/// Retries allowed per job unless the payload says otherwise.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

// ============================================================================
// Enums
// ============================================================================

closed_enum! {
    /// Every job type the monitor knows how to route.
    pub enum JobType as "job type" {
        FetchFarmMonitoringData => "fetch-farm-monitoring-data",
        DocumentValidation => "document-validation",
        FarmImagery => "farm-imagery",
    }
}

impl JobType {
    /// Job types served by the shared AI pool rather than a policy pool.
    pub fn is_ai(&self) -> bool {
        match self {
            JobType::FetchFarmMonitoringData => false,
            JobType::DocumentValidation | JobType::FarmImagery => true,
        }
    }
}

closed_enum! {
    pub enum JobStatus as "job status" {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Retrying => "retrying",
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

// ============================================================================
// Queue payloads
// ============================================================================

/// A unit of work as submitted to a pool.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobPayload {
    #[builder(default = Uuid::now_v7().to_string())]
    pub job_id: String,
    pub job_type: JobType,
    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub params: serde_json::Value,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
    #[builder(default)]
    pub retry_count: i32,
}

/// A payload paired with the execution row that records it.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub execution_id: JobExecutionId,
    pub policy_id: Option<PolicyId>,
    pub payload: JobPayload,
}

/// One parameter a monitoring fetch should pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredParameter {
    pub data_source_id: DataSourceId,
    pub parameter_name: String,
}

/// Params of a `fetch-farm-monitoring-data` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringFetchParams {
    pub policy_id: PolicyId,
    pub farm_id: FarmId,
    pub base_policy_id: BasePolicyId,
    #[serde(default)]
    pub parameters: Vec<MonitoredParameter>,
    pub lookback_days: i32,
    pub scheduled_at: DateTime<Utc>,
}

// ============================================================================
// Execution history
// ============================================================================

/// Row of `worker_job_execution`: one per job, updated in place across
/// attempts. The shared AI pool records a `None` policy id.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJobExecution {
    pub id: JobExecutionId,
    pub policy_id: Option<PolicyId>,
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl WorkerJobExecution {
    pub fn pending(policy_id: Option<PolicyId>, payload: &JobPayload) -> Self {
        Self {
            id: JobExecutionId::new(),
            policy_id,
            job_id: payload.job_id.clone(),
            job_type: payload.job_type,
            status: JobStatus::Pending,
            retry_count: payload.retry_count,
            max_retries: payload.max_retries,
            started_at: None,
            completed_at: None,
            error_message: None,
            result_summary: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_wire_names() {
        assert_eq!(
            "fetch-farm-monitoring-data".parse::<JobType>().unwrap(),
            JobType::FetchFarmMonitoringData
        );
        assert_eq!(JobType::DocumentValidation.as_str(), "document-validation");
        assert!("fetch_farm_monitoring_data".parse::<JobType>().is_err());
    }

    #[test]
    fn test_ai_routing() {
        assert!(!JobType::FetchFarmMonitoringData.is_ai());
        assert!(JobType::DocumentValidation.is_ai());
        assert!(JobType::FarmImagery.is_ai());
    }

    #[test]
    fn test_payload_defaults() {
        let payload = JobPayload::builder()
            .job_type(JobType::FarmImagery)
            .build();
        assert_eq!(payload.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(payload.retry_count, 0);
        assert!(payload.params.is_object());
        assert!(!payload.job_id.is_empty());
    }

    #[test]
    fn test_unknown_job_type_in_payload_is_rejected() {
        let raw = serde_json::json!({
            "job_id": "abc",
            "job_type": "send-email",
            "params": {},
            "max_retries": 3,
            "retry_count": 0
        });
        let err = serde_json::from_value::<JobPayload>(raw).unwrap_err();
        assert!(err.to_string().contains("unknown job type"));
    }

    #[test]
    fn test_pending_execution_mirrors_payload() {
        let payload = JobPayload::builder()
            .job_type(JobType::FetchFarmMonitoringData)
            .job_id("job-1")
            .max_retries(5)
            .build();
        let policy_id = PolicyId::new();
        let execution = WorkerJobExecution::pending(Some(policy_id), &payload);
        assert_eq!(execution.status, JobStatus::Pending);
        assert_eq!(execution.job_id, "job-1");
        assert_eq!(execution.max_retries, 5);
        assert_eq!(execution.policy_id, Some(policy_id));
        assert!(execution.started_at.is_none());
    }
}
