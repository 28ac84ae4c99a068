//! Durable storage contract for worker infrastructure.
//!
//! Implementations:
//! - [`PostgresWorkerPersistor`](super::PostgresWorkerPersistor) - production
//! - [`InMemoryWorkerPersistor`](super::testing::InMemoryWorkerPersistor) - tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::WorkerResult;
use super::job::WorkerJobExecution;
use super::state::{LifecycleStatus, WorkerPoolState, WorkerSchedulerState};
use crate::common::{JobExecutionId, PolicyId};

#[async_trait]
pub trait WorkerPersistor: Send + Sync {
    // ------------------------------------------------------------------------
    // Pool and scheduler state
    // ------------------------------------------------------------------------

    /// Insert both rows in one transaction. A duplicate policy id or name
    /// yields `WorkerError::PoolAlreadyExists`.
    async fn create_infrastructure(
        &self,
        pool: &WorkerPoolState,
        scheduler: &WorkerSchedulerState,
    ) -> WorkerResult<()>;

    async fn get_pool_state(&self, policy_id: PolicyId) -> WorkerResult<Option<WorkerPoolState>>;

    async fn get_scheduler_state(
        &self,
        policy_id: PolicyId,
    ) -> WorkerResult<Option<WorkerSchedulerState>>;

    async fn list_pool_states(
        &self,
        status: Option<LifecycleStatus>,
    ) -> WorkerResult<Vec<WorkerPoolState>>;

    /// Set `pool_status`, stamping `started_at` on activation and
    /// `stopped_at` on stop.
    async fn set_pool_status(
        &self,
        policy_id: PolicyId,
        status: LifecycleStatus,
        at: DateTime<Utc>,
    ) -> WorkerResult<()>;

    async fn set_scheduler_status(
        &self,
        policy_id: PolicyId,
        status: LifecycleStatus,
        at: DateTime<Utc>,
    ) -> WorkerResult<()>;

    async fn touch_pool_last_job(&self, policy_id: PolicyId, at: DateTime<Utc>) -> WorkerResult<()>;

    /// Persist a completed tick: `last_run_at`, `next_run_at`, `run_count + 1`.
    async fn record_scheduler_run(
        &self,
        policy_id: PolicyId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> WorkerResult<()>;

    /// Policies whose pool and scheduler are both `active`.
    async fn load_active_policy_ids(&self) -> WorkerResult<Vec<PolicyId>>;

    async fn delete_infrastructure(&self, policy_id: PolicyId) -> WorkerResult<()>;

    // ------------------------------------------------------------------------
    // Job execution history
    // ------------------------------------------------------------------------

    async fn create_job_execution(&self, execution: &WorkerJobExecution) -> WorkerResult<()>;

    async fn mark_job_running(
        &self,
        id: JobExecutionId,
        started_at: DateTime<Utc>,
    ) -> WorkerResult<()>;

    async fn mark_job_completed(
        &self,
        id: JobExecutionId,
        completed_at: DateTime<Utc>,
        result_summary: &serde_json::Value,
    ) -> WorkerResult<()>;

    async fn mark_job_retrying(
        &self,
        id: JobExecutionId,
        retry_count: i32,
        error: &str,
    ) -> WorkerResult<()>;

    /// Terminal failure. `started_at` is backfilled with `completed_at` for
    /// jobs that never ran so `completed_at >= started_at` always holds.
    async fn mark_job_failed(
        &self,
        id: JobExecutionId,
        retry_count: i32,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> WorkerResult<()>;

    async fn get_job_execution(
        &self,
        id: JobExecutionId,
    ) -> WorkerResult<Option<WorkerJobExecution>>;

    /// Most recent executions first.
    async fn job_executions_for_policy(
        &self,
        policy_id: PolicyId,
        limit: i64,
    ) -> WorkerResult<Vec<WorkerJobExecution>>;

    /// Fail every pending, running or retrying execution of a policy, or of
    /// the AI pool when `policy_id` is `None`. Returns how many rows changed.
    async fn fail_unfinished_executions(
        &self,
        policy_id: Option<PolicyId>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> WorkerResult<u64>;
}
