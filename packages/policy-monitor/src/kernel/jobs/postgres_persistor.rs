//! PostgreSQL-backed [`WorkerPersistor`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::error::{WorkerError, WorkerResult};
use super::job::{JobStatus, WorkerJobExecution};
use super::persistor::WorkerPersistor;
use super::state::{LifecycleStatus, WorkerPoolState, WorkerSchedulerState};
use crate::common::{JobExecutionId, PolicyId};

pub struct PostgresWorkerPersistor {
    pool: PgPool,
}

impl PostgresWorkerPersistor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_insert_error(err: sqlx::Error, policy_id: PolicyId) -> WorkerError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            WorkerError::PoolAlreadyExists(policy_id)
        }
        _ => WorkerError::Database(err),
    }
}

#[async_trait]
impl WorkerPersistor for PostgresWorkerPersistor {
    async fn create_infrastructure(
        &self,
        pool: &WorkerPoolState,
        scheduler: &WorkerSchedulerState,
    ) -> WorkerResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO worker_pool_state (
                policy_id, pool_name, queue_name_base, num_workers, job_timeout,
                pool_status, created_at, started_at, stopped_at, last_job_at, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(pool.policy_id)
        .bind(&pool.pool_name)
        .bind(&pool.queue_name_base)
        .bind(pool.num_workers)
        .bind(pool.job_timeout)
        .bind(pool.pool_status)
        .bind(pool.created_at)
        .bind(pool.started_at)
        .bind(pool.stopped_at)
        .bind(pool.last_job_at)
        .bind(&pool.metadata)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, pool.policy_id))?;

        sqlx::query(
            r#"
            INSERT INTO worker_scheduler_state (
                policy_id, scheduler_name, monitor_interval, monitor_frequency_unit,
                scheduler_status, created_at, started_at, stopped_at, last_run_at,
                next_run_at, run_count, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(scheduler.policy_id)
        .bind(&scheduler.scheduler_name)
        .bind(scheduler.monitor_interval)
        .bind(scheduler.monitor_frequency_unit)
        .bind(scheduler.scheduler_status)
        .bind(scheduler.created_at)
        .bind(scheduler.started_at)
        .bind(scheduler.stopped_at)
        .bind(scheduler.last_run_at)
        .bind(scheduler.next_run_at)
        .bind(scheduler.run_count)
        .bind(&scheduler.metadata)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_insert_error(e, scheduler.policy_id))?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_pool_state(&self, policy_id: PolicyId) -> WorkerResult<Option<WorkerPoolState>> {
        sqlx::query_as::<_, WorkerPoolState>(
            r#"
            SELECT policy_id, pool_name, queue_name_base, num_workers, job_timeout, pool_status,
                   created_at, started_at, stopped_at, last_job_at, metadata
            FROM worker_pool_state
            WHERE policy_id = $1
            "#,
        )
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn get_scheduler_state(
        &self,
        policy_id: PolicyId,
    ) -> WorkerResult<Option<WorkerSchedulerState>> {
        sqlx::query_as::<_, WorkerSchedulerState>(
            r#"
            SELECT policy_id, scheduler_name, monitor_interval, monitor_frequency_unit,
                   scheduler_status, created_at, started_at, stopped_at, last_run_at,
                   next_run_at, run_count, metadata
            FROM worker_scheduler_state
            WHERE policy_id = $1
            "#,
        )
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn list_pool_states(
        &self,
        status: Option<LifecycleStatus>,
    ) -> WorkerResult<Vec<WorkerPoolState>> {
        sqlx::query_as::<_, WorkerPoolState>(
            r#"
            SELECT policy_id, pool_name, queue_name_base, num_workers, job_timeout, pool_status,
                   created_at, started_at, stopped_at, last_job_at, metadata
            FROM worker_pool_state
            WHERE $1::TEXT IS NULL OR pool_status = $1
            ORDER BY created_at
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn set_pool_status(
        &self,
        policy_id: PolicyId,
        status: LifecycleStatus,
        at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE worker_pool_state
            SET pool_status = $2,
                started_at = CASE WHEN $2 = 'active' THEN $3 ELSE started_at END,
                stopped_at = CASE WHEN $2 = 'stopped' THEN $3 ELSE stopped_at END
            WHERE policy_id = $1
            "#,
        )
        .bind(policy_id)
        .bind(status)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorkerError::PoolNotFound(policy_id));
        }
        Ok(())
    }

    async fn set_scheduler_status(
        &self,
        policy_id: PolicyId,
        status: LifecycleStatus,
        at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE worker_scheduler_state
            SET scheduler_status = $2,
                started_at = CASE WHEN $2 = 'active' THEN $3 ELSE started_at END,
                stopped_at = CASE WHEN $2 = 'stopped' THEN $3 ELSE stopped_at END
            WHERE policy_id = $1
            "#,
        )
        .bind(policy_id)
        .bind(status)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorkerError::PoolNotFound(policy_id));
        }
        Ok(())
    }

    async fn touch_pool_last_job(&self, policy_id: PolicyId, at: DateTime<Utc>) -> WorkerResult<()> {
        sqlx::query("UPDATE worker_pool_state SET last_job_at = $2 WHERE policy_id = $1")
            .bind(policy_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_scheduler_run(
        &self,
        policy_id: PolicyId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        sqlx::query(
            r#"
            UPDATE worker_scheduler_state
            SET last_run_at = $2,
                next_run_at = $3,
                run_count = run_count + 1
            WHERE policy_id = $1
            "#,
        )
        .bind(policy_id)
        .bind(ran_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_active_policy_ids(&self) -> WorkerResult<Vec<PolicyId>> {
        sqlx::query_scalar::<_, PolicyId>(
            r#"
            SELECT DISTINCT p.policy_id
            FROM worker_pool_state p
            JOIN worker_scheduler_state s ON s.policy_id = p.policy_id
            WHERE p.pool_status = 'active' AND s.scheduler_status = 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn delete_infrastructure(&self, policy_id: PolicyId) -> WorkerResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM worker_scheduler_state WHERE policy_id = $1")
            .bind(policy_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM worker_pool_state WHERE policy_id = $1")
            .bind(policy_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_job_execution(&self, execution: &WorkerJobExecution) -> WorkerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_job_execution (
                id, policy_id, job_id, job_type, status, retry_count, max_retries,
                started_at, completed_at, error_message, result_summary, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(execution.id)
        .bind(execution.policy_id)
        .bind(&execution.job_id)
        .bind(execution.job_type)
        .bind(execution.status)
        .bind(execution.retry_count)
        .bind(execution.max_retries)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(&execution.error_message)
        .bind(&execution.result_summary)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_running(
        &self,
        id: JobExecutionId,
        started_at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        sqlx::query(
            r#"
            UPDATE worker_job_execution
            SET status = $2, started_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(JobStatus::Running)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_completed(
        &self,
        id: JobExecutionId,
        completed_at: DateTime<Utc>,
        result_summary: &serde_json::Value,
    ) -> WorkerResult<()> {
        sqlx::query(
            r#"
            UPDATE worker_job_execution
            SET status = $2, completed_at = $3, result_summary = $4, error_message = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(JobStatus::Completed)
        .bind(completed_at)
        .bind(result_summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_retrying(
        &self,
        id: JobExecutionId,
        retry_count: i32,
        error: &str,
    ) -> WorkerResult<()> {
        sqlx::query(
            r#"
            UPDATE worker_job_execution
            SET status = $2, retry_count = $3, error_message = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(JobStatus::Retrying)
        .bind(retry_count)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_job_failed(
        &self,
        id: JobExecutionId,
        retry_count: i32,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> WorkerResult<()> {
        sqlx::query(
            r#"
            UPDATE worker_job_execution
            SET status = $2,
                retry_count = $3,
                started_at = COALESCE(started_at, $4),
                completed_at = GREATEST($4, COALESCE(started_at, $4)),
                error_message = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(JobStatus::Failed)
        .bind(retry_count)
        .bind(completed_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job_execution(
        &self,
        id: JobExecutionId,
    ) -> WorkerResult<Option<WorkerJobExecution>> {
        sqlx::query_as::<_, WorkerJobExecution>(
            r#"
            SELECT id, policy_id, job_id, job_type, status, retry_count, max_retries,
                   started_at, completed_at, error_message, result_summary, created_at
            FROM worker_job_execution
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn job_executions_for_policy(
        &self,
        policy_id: PolicyId,
        limit: i64,
    ) -> WorkerResult<Vec<WorkerJobExecution>> {
        sqlx::query_as::<_, WorkerJobExecution>(
            r#"
            SELECT id, policy_id, job_id, job_type, status, retry_count, max_retries,
                   started_at, completed_at, error_message, result_summary, created_at
            FROM worker_job_execution
            WHERE policy_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(policy_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn fail_unfinished_executions(
        &self,
        policy_id: Option<PolicyId>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> WorkerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE worker_job_execution
            SET status = 'failed',
                started_at = COALESCE(started_at, $3),
                completed_at = GREATEST($3, COALESCE(started_at, $3)),
                error_message = $2
            WHERE policy_id IS NOT DISTINCT FROM $1
              AND status IN ('pending', 'running', 'retrying')
            "#,
        )
        .bind(policy_id)
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
