//! Runs one job attempt and records the outcome.
//!
//! ```text
//! record_enqueued ──► pending
//! execute ──► running ──┬─► completed
//!                       ├─► retrying ──(backoff)──► queue
//!                       └─► failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{JobError, WorkerResult};
use super::job::{JobPayload, QueuedJob, WorkerJobExecution};
use super::persistor::WorkerPersistor;
use super::registry::{JobContext, JobHandlerRegistry};
use crate::common::PolicyId;

/// `base * 2^retry_count`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(3600),
        }
    }
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 31) as u32;
        self.base
            .checked_mul(2u32.saturating_pow(exponent))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// What the pool should do after an attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed(serde_json::Value),
    /// Put the job back on the queue after `delay`.
    Retry { job: QueuedJob, delay: Duration },
    Failed(String),
}

pub struct JobExecutor {
    registry: Arc<JobHandlerRegistry>,
    persistor: Arc<dyn WorkerPersistor>,
    job_timeout: Duration,
    backoff: RetryBackoff,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<JobHandlerRegistry>,
        persistor: Arc<dyn WorkerPersistor>,
        job_timeout: Duration,
        backoff: RetryBackoff,
    ) -> Self {
        Self {
            registry,
            persistor,
            job_timeout,
            backoff,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Insert the `pending` execution row for a job about to be queued.
    pub async fn record_enqueued(
        &self,
        policy_id: Option<PolicyId>,
        payload: JobPayload,
    ) -> WorkerResult<QueuedJob> {
        let execution = WorkerJobExecution::pending(policy_id, &payload);
        self.persistor.create_job_execution(&execution).await?;
        debug!(
            execution_id = %execution.id,
            job_id = %payload.job_id,
            job_type = %payload.job_type,
            "job enqueued"
        );
        Ok(QueuedJob {
            execution_id: execution.id,
            policy_id,
            payload,
        })
    }

    /// Mark a job that never reached a worker as failed.
    pub async fn fail_unstarted(&self, job: &QueuedJob, reason: &str) {
        if let Err(e) = self
            .persistor
            .mark_job_failed(job.execution_id, job.payload.retry_count, Utc::now(), reason)
            .await
        {
            error!(execution_id = %job.execution_id, error = %e, "failed to record unstarted job");
        }
    }

    /// Run one attempt of `job`. `cancel` is the pool's hard-stop signal.
    pub async fn execute(&self, mut job: QueuedJob, cancel: &CancellationToken) -> ExecutionOutcome {
        let started_at = Utc::now();
        if let Err(e) = self
            .persistor
            .mark_job_running(job.execution_id, started_at)
            .await
        {
            error!(execution_id = %job.execution_id, error = %e, "failed to mark job running");
        }

        let result = self.invoke(&job, cancel).await;

        match result {
            Ok(summary) => {
                let completed_at = Utc::now();
                if let Err(e) = self
                    .persistor
                    .mark_job_completed(job.execution_id, completed_at, &summary)
                    .await
                {
                    error!(execution_id = %job.execution_id, error = %e, "failed to mark job completed");
                }
                if let Some(policy_id) = job.policy_id {
                    if let Err(e) = self
                        .persistor
                        .touch_pool_last_job(policy_id, completed_at)
                        .await
                    {
                        error!(policy_id = %policy_id, error = %e, "failed to update last_job_at");
                    }
                }
                info!(
                    execution_id = %job.execution_id,
                    job_type = %job.payload.job_type,
                    attempt = job.payload.retry_count + 1,
                    "job completed"
                );
                ExecutionOutcome::Completed(summary)
            }
            Err(err) => {
                let message = err.to_string();
                let retry_count = if err.should_retry() {
                    job.payload.retry_count + 1
                } else {
                    job.payload.retry_count
                };

                if err.should_retry() && retry_count < job.payload.max_retries {
                    let delay = self.backoff.delay_for(retry_count);
                    if let Err(e) = self
                        .persistor
                        .mark_job_retrying(job.execution_id, retry_count, &message)
                        .await
                    {
                        error!(execution_id = %job.execution_id, error = %e, "failed to mark job retrying");
                    }
                    warn!(
                        execution_id = %job.execution_id,
                        job_type = %job.payload.job_type,
                        retry_count,
                        max_retries = job.payload.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error_kind = err.kind(),
                        error = %message,
                        "job failed, retrying"
                    );
                    job.payload.retry_count = retry_count;
                    return ExecutionOutcome::Retry { job, delay };
                }

                if let Err(e) = self
                    .persistor
                    .mark_job_failed(job.execution_id, retry_count, Utc::now(), &message)
                    .await
                {
                    error!(execution_id = %job.execution_id, error = %e, "failed to mark job failed");
                }
                warn!(
                    execution_id = %job.execution_id,
                    job_type = %job.payload.job_type,
                    retry_count,
                    error_kind = err.kind(),
                    error = %message,
                    "job failed"
                );
                ExecutionOutcome::Failed(message)
            }
        }
    }

    async fn invoke(
        &self,
        job: &QueuedJob,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, JobError> {
        let job_type = job.payload.job_type;
        let handler = self.registry.get(job_type).ok_or_else(|| {
            JobError::permanent(anyhow!("no handler registered for job type {}", job_type))
        })?;

        let ctx = JobContext {
            job_id: job.payload.job_id.clone(),
            job_type,
            policy_id: job.policy_id,
            attempt: job.payload.retry_count + 1,
            cancel: cancel.child_token(),
        };
        let handler_cancel = ctx.cancel.clone();
        let params = job.payload.params.clone();

        // Spawned so a panicking handler only takes down its own task.
        let mut task =
            tokio::spawn(async move { handler.execute(&ctx, &params).await });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(JobError::transient(anyhow!("job handler panicked"))),
                Err(e) => Err(JobError::transient(anyhow!("job handler aborted: {}", e))),
            },
            _ = tokio::time::sleep(self.job_timeout) => {
                handler_cancel.cancel();
                task.abort();
                Err(JobError::Timeout(self.job_timeout))
            }
            _ = cancel.cancelled() => {
                task.abort();
                Err(JobError::Cancelled)
            }
        }
    }
}
