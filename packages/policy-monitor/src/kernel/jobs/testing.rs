//! Job testing utilities.
//!
//! [`InMemoryWorkerPersistor`] stands in for Postgres, and the handler helpers
//! script failures so retry and timeout paths can be driven deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::{JobError, WorkerError, WorkerResult};
use super::job::{JobStatus, WorkerJobExecution};
use super::persistor::WorkerPersistor;
use super::registry::{JobContext, JobHandler};
use super::state::{LifecycleStatus, MonitorTarget, WorkerPoolState, WorkerSchedulerState};
use crate::common::{JobExecutionId, PolicyId};
use crate::kernel::BasePolicySource;

// ============================================================================
// In-memory persistor
// ============================================================================

#[derive(Default)]
struct Tables {
    pools: HashMap<PolicyId, WorkerPoolState>,
    schedulers: HashMap<PolicyId, WorkerSchedulerState>,
    executions: Vec<WorkerJobExecution>,
}

/// Worker state kept in process memory. Mirrors the Postgres constraints that
/// matter to callers: unique pool per policy and transactional creation.
#[derive(Default)]
pub struct InMemoryWorkerPersistor {
    tables: RwLock<Tables>,
}

impl InMemoryWorkerPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows directly, bypassing the uniqueness check.
    pub fn insert_rows(&self, pool: WorkerPoolState, scheduler: WorkerSchedulerState) {
        let mut tables = self.write();
        tables.pools.insert(pool.policy_id, pool);
        tables.schedulers.insert(scheduler.policy_id, scheduler);
    }

    pub fn insert_execution(&self, execution: WorkerJobExecution) {
        self.write().executions.push(execution);
    }

    pub fn executions(&self) -> Vec<WorkerJobExecution> {
        self.read().executions.clone()
    }

    pub fn executions_with_status(&self, status: JobStatus) -> Vec<WorkerJobExecution> {
        self.read()
            .executions
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    pub fn pool_count(&self) -> usize {
        self.read().pools.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    fn update_execution(
        &self,
        id: JobExecutionId,
        f: impl FnOnce(&mut WorkerJobExecution),
    ) -> WorkerResult<()> {
        let mut tables = self.write();
        if let Some(execution) = tables.executions.iter_mut().find(|e| e.id == id) {
            f(execution);
        }
        Ok(())
    }
}

fn stamp(
    status: LifecycleStatus,
    at: DateTime<Utc>,
    started_at: &mut Option<DateTime<Utc>>,
    stopped_at: &mut Option<DateTime<Utc>>,
) {
    match status {
        LifecycleStatus::Active => *started_at = Some(at),
        LifecycleStatus::Stopped => *stopped_at = Some(at),
        LifecycleStatus::Created | LifecycleStatus::Archived => {}
    }
}

#[async_trait]
impl WorkerPersistor for InMemoryWorkerPersistor {
    async fn create_infrastructure(
        &self,
        pool: &WorkerPoolState,
        scheduler: &WorkerSchedulerState,
    ) -> WorkerResult<()> {
        let mut tables = self.write();
        let name_taken = tables
            .pools
            .values()
            .any(|p| p.pool_name == pool.pool_name);
        if tables.pools.contains_key(&pool.policy_id)
            || tables.schedulers.contains_key(&scheduler.policy_id)
            || name_taken
        {
            return Err(WorkerError::PoolAlreadyExists(pool.policy_id));
        }
        tables.pools.insert(pool.policy_id, pool.clone());
        tables.schedulers.insert(scheduler.policy_id, scheduler.clone());
        Ok(())
    }

    async fn get_pool_state(&self, policy_id: PolicyId) -> WorkerResult<Option<WorkerPoolState>> {
        Ok(self.read().pools.get(&policy_id).cloned())
    }

    async fn get_scheduler_state(
        &self,
        policy_id: PolicyId,
    ) -> WorkerResult<Option<WorkerSchedulerState>> {
        Ok(self.read().schedulers.get(&policy_id).cloned())
    }

    async fn list_pool_states(
        &self,
        status: Option<LifecycleStatus>,
    ) -> WorkerResult<Vec<WorkerPoolState>> {
        let mut pools: Vec<_> = self
            .read()
            .pools
            .values()
            .filter(|p| status.map_or(true, |s| p.pool_status == s))
            .cloned()
            .collect();
        pools.sort_by_key(|p| p.created_at);
        Ok(pools)
    }

    async fn set_pool_status(
        &self,
        policy_id: PolicyId,
        status: LifecycleStatus,
        at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        let mut tables = self.write();
        let pool = tables
            .pools
            .get_mut(&policy_id)
            .ok_or(WorkerError::PoolNotFound(policy_id))?;
        pool.pool_status = status;
        stamp(status, at, &mut pool.started_at, &mut pool.stopped_at);
        Ok(())
    }

    async fn set_scheduler_status(
        &self,
        policy_id: PolicyId,
        status: LifecycleStatus,
        at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        let mut tables = self.write();
        let scheduler = tables
            .schedulers
            .get_mut(&policy_id)
            .ok_or(WorkerError::PoolNotFound(policy_id))?;
        scheduler.scheduler_status = status;
        stamp(status, at, &mut scheduler.started_at, &mut scheduler.stopped_at);
        Ok(())
    }

    async fn touch_pool_last_job(&self, policy_id: PolicyId, at: DateTime<Utc>) -> WorkerResult<()> {
        if let Some(pool) = self.write().pools.get_mut(&policy_id) {
            pool.last_job_at = Some(at);
        }
        Ok(())
    }

    async fn record_scheduler_run(
        &self,
        policy_id: PolicyId,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        if let Some(scheduler) = self.write().schedulers.get_mut(&policy_id) {
            scheduler.last_run_at = Some(ran_at);
            scheduler.next_run_at = Some(next_run_at);
            scheduler.run_count += 1;
        }
        Ok(())
    }

    async fn load_active_policy_ids(&self) -> WorkerResult<Vec<PolicyId>> {
        let tables = self.read();
        Ok(tables
            .pools
            .values()
            .filter(|p| p.pool_status == LifecycleStatus::Active)
            .filter(|p| {
                tables
                    .schedulers
                    .get(&p.policy_id)
                    .is_some_and(|s| s.scheduler_status == LifecycleStatus::Active)
            })
            .map(|p| p.policy_id)
            .collect())
    }

    async fn delete_infrastructure(&self, policy_id: PolicyId) -> WorkerResult<()> {
        let mut tables = self.write();
        tables.pools.remove(&policy_id);
        tables.schedulers.remove(&policy_id);
        Ok(())
    }

    async fn create_job_execution(&self, execution: &WorkerJobExecution) -> WorkerResult<()> {
        self.write().executions.push(execution.clone());
        Ok(())
    }

    async fn mark_job_running(
        &self,
        id: JobExecutionId,
        started_at: DateTime<Utc>,
    ) -> WorkerResult<()> {
        self.update_execution(id, |e| {
            e.status = JobStatus::Running;
            e.started_at = Some(started_at);
        })
    }

    async fn mark_job_completed(
        &self,
        id: JobExecutionId,
        completed_at: DateTime<Utc>,
        result_summary: &serde_json::Value,
    ) -> WorkerResult<()> {
        self.update_execution(id, |e| {
            e.status = JobStatus::Completed;
            e.completed_at = Some(completed_at);
            e.result_summary = Some(result_summary.clone());
            e.error_message = None;
        })
    }

    async fn mark_job_retrying(
        &self,
        id: JobExecutionId,
        retry_count: i32,
        error: &str,
    ) -> WorkerResult<()> {
        self.update_execution(id, |e| {
            e.status = JobStatus::Retrying;
            e.retry_count = retry_count;
            e.error_message = Some(error.to_string());
        })
    }

    async fn mark_job_failed(
        &self,
        id: JobExecutionId,
        retry_count: i32,
        completed_at: DateTime<Utc>,
        error: &str,
    ) -> WorkerResult<()> {
        self.update_execution(id, |e| {
            let started_at = *e.started_at.get_or_insert(completed_at);
            e.status = JobStatus::Failed;
            e.retry_count = retry_count;
            e.completed_at = Some(completed_at.max(started_at));
            e.error_message = Some(error.to_string());
        })
    }

    async fn get_job_execution(
        &self,
        id: JobExecutionId,
    ) -> WorkerResult<Option<WorkerJobExecution>> {
        Ok(self.read().executions.iter().find(|e| e.id == id).cloned())
    }

    async fn job_executions_for_policy(
        &self,
        policy_id: PolicyId,
        limit: i64,
    ) -> WorkerResult<Vec<WorkerJobExecution>> {
        let mut executions: Vec<_> = self
            .read()
            .executions
            .iter()
            .filter(|e| e.policy_id == Some(policy_id))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(executions)
    }

    async fn fail_unfinished_executions(
        &self,
        policy_id: Option<PolicyId>,
        reason: &str,
        at: DateTime<Utc>,
    ) -> WorkerResult<u64> {
        let mut tables = self.write();
        let mut changed = 0;
        for e in tables
            .executions
            .iter_mut()
            .filter(|e| e.policy_id == policy_id && !e.status.is_terminal())
        {
            let started_at = *e.started_at.get_or_insert(at);
            e.status = JobStatus::Failed;
            e.completed_at = Some(at.max(started_at));
            e.error_message = Some(reason.to_string());
            changed += 1;
        }
        Ok(changed)
    }
}

// ============================================================================
// Policy source
// ============================================================================

/// Policies held in memory. Flip a policy inactive to exercise the stale
/// policy path of the scheduler.
#[derive(Default)]
pub struct StaticPolicySource {
    policies: RwLock<HashMap<PolicyId, (MonitorTarget, bool)>>,
}

impl StaticPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_active(&self, target: MonitorTarget) {
        self.policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(target.policy_id, (target, true));
    }

    pub fn set_active(&self, policy_id: PolicyId, active: bool) {
        if let Some(entry) = self
            .policies
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&policy_id)
        {
            entry.1 = active;
        }
    }
}

#[async_trait]
impl BasePolicySource for StaticPolicySource {
    async fn active_policy_ids(&self) -> anyhow::Result<Vec<PolicyId>> {
        Ok(self
            .policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, (_, active))| *active)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn is_policy_active(&self, policy_id: PolicyId) -> anyhow::Result<bool> {
        Ok(self
            .policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&policy_id)
            .is_some_and(|(_, active)| *active))
    }

    async fn monitor_target(&self, policy_id: PolicyId) -> anyhow::Result<MonitorTarget> {
        self.policies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&policy_id)
            .map(|(target, _)| target.clone())
            .ok_or_else(|| anyhow::anyhow!("policy {} not found", policy_id))
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Scripted handler: returns queued outcomes in order, then `Ok` forever.
/// Counts every invocation.
#[derive(Default)]
pub struct MockJobHandler {
    script: std::sync::Mutex<Vec<Result<serde_json::Value, JobError>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    attempts: std::sync::Mutex<Vec<i32>>,
}

impl MockJobHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails `n` times with a transient error before succeeding.
    pub fn failing_transiently(n: usize) -> Self {
        let handler = Self::new();
        for i in 0..n {
            handler.push(Err(JobError::transient(anyhow::anyhow!(
                "provider unavailable (attempt {})",
                i + 1
            ))));
        }
        handler
    }

    pub fn failing_permanently() -> Self {
        let handler = Self::new();
        handler.push(Err(JobError::permanent(anyhow::anyhow!(
            "missing or invalid policy_id parameter"
        ))));
        handler
    }

    /// Sleeps before answering. Used to trip the job timeout or hold a
    /// worker busy across a stop.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, outcome: Result<serde_json::Value, JobError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Attempt numbers seen, in call order.
    pub fn attempts(&self) -> Vec<i32> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl JobHandler for MockJobHandler {
    async fn execute(
        &self,
        ctx: &JobContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ctx.attempt);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            if script.is_empty() {
                None
            } else {
                Some(script.remove(0))
            }
        };
        next.unwrap_or_else(|| Ok(serde_json::json!({ "handled": params })))
    }
}

/// Wait until `check` holds, polling every 10ms, for at most `timeout`.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
