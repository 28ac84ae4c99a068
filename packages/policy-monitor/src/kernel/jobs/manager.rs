//! Worker pool manager.
//!
//! Owns one [`WorkerPool`] plus one [`PolicyScheduler`] per monitored policy,
//! and the shared AI pool. Every lifecycle change is persisted through the
//! [`WorkerPersistor`] before it is reported as done.
//!
//! ```text
//! create_pool ──► rows "created" (one transaction)
//! start_pool  ──► rows "active", workers + scheduler running
//! stop_pool   ──► scheduler stopped, queue drained, rows "stopped"
//! archive_pool ─► rows "archived", runtime forgotten
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use super::error::{WorkerError, WorkerResult};
use super::executor::{JobExecutor, RetryBackoff};
use super::job::{JobPayload, JobType, DEFAULT_MAX_RETRIES};
use super::persistor::WorkerPersistor;
use super::pool::{PoolOptions, PoolSnapshot, WorkerPool};
use super::registry::{JobHandler, JobHandlerRegistry};
use super::scheduler::PolicyScheduler;
use super::state::{
    LifecycleStatus, MonitorTarget, WorkerPoolState, WorkerSchedulerState,
};
use crate::common::{JobExecutionId, PolicyId};
use crate::kernel::BasePolicySource;

pub const AI_POOL_NAME: &str = "shared-ai-pool";

/// Sizing and timing applied to every pool the manager creates.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct WorkerDefaults {
    #[builder(default = 5)]
    pub num_workers: usize,
    #[builder(default = 100)]
    pub queue_capacity: usize,
    #[builder(default = Duration::from_secs(30 * 60))]
    pub job_timeout: Duration,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: i32,
    #[builder(default)]
    pub backoff: RetryBackoff,
    /// Bound on in-flight work at stop and on the whole of `shutdown`.
    #[builder(default = Duration::from_secs(30))]
    pub shutdown_grace: Duration,
    #[builder(default = 3)]
    pub ai_pool_workers: usize,
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHandle {
    pub policy_id: PolicyId,
    pub pool_name: String,
}

/// Persisted rows plus the live view, if the pool runs in this process.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool: WorkerPoolState,
    pub scheduler: Option<WorkerSchedulerState>,
    pub runtime: Option<PoolSnapshot>,
    pub scheduler_running: bool,
}

#[derive(Clone)]
struct PolicyRuntime {
    pool: Arc<WorkerPool>,
    scheduler: Arc<PolicyScheduler>,
    resume_from: Option<DateTime<Utc>>,
}

struct ManagerInner {
    persistor: Arc<dyn WorkerPersistor>,
    registry: Arc<JobHandlerRegistry>,
    policies: Arc<dyn BasePolicySource>,
    defaults: WorkerDefaults,
    runtimes: RwLock<HashMap<PolicyId, PolicyRuntime>>,
    ai_pool: Arc<WorkerPool>,
    root: CancellationToken,
    retire_tx: mpsc::UnboundedSender<PolicyId>,
}

#[derive(Clone)]
pub struct WorkerPoolManager {
    inner: Arc<ManagerInner>,
}

fn check_transition(
    entity: &'static str,
    policy_id: PolicyId,
    from: LifecycleStatus,
    to: LifecycleStatus,
) -> WorkerResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(WorkerError::InvalidTransition {
            entity,
            policy_id,
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

impl WorkerPoolManager {
    /// Build the manager and start its shared AI pool. Must be called inside
    /// a tokio runtime.
    pub fn new(
        persistor: Arc<dyn WorkerPersistor>,
        registry: Arc<JobHandlerRegistry>,
        policies: Arc<dyn BasePolicySource>,
        defaults: WorkerDefaults,
    ) -> Self {
        let root = CancellationToken::new();

        let ai_executor = Arc::new(JobExecutor::new(
            registry.clone(),
            persistor.clone(),
            defaults.job_timeout,
            defaults.backoff,
        ));
        let ai_pool = WorkerPool::new(
            PoolOptions {
                name: AI_POOL_NAME.to_string(),
                policy_id: None,
                num_workers: defaults.ai_pool_workers,
                queue_capacity: defaults.queue_capacity,
                grace: defaults.shutdown_grace,
            },
            ai_executor,
            root.child_token(),
        );
        ai_pool.start();

        let (retire_tx, retire_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            persistor,
            registry,
            policies,
            defaults,
            runtimes: RwLock::new(HashMap::new()),
            ai_pool,
            root,
            retire_tx,
        });
        spawn_reaper(Arc::downgrade(&inner), retire_rx);

        Self { inner }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    pub fn register_job_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.inner.registry.register(job_type, handler);
    }

    pub fn registry(&self) -> Arc<JobHandlerRegistry> {
        self.inner.registry.clone()
    }

    pub fn persistor(&self) -> Arc<dyn WorkerPersistor> {
        self.inner.persistor.clone()
    }

    pub fn defaults(&self) -> &WorkerDefaults {
        &self.inner.defaults
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Persist fresh `created` rows for the policy and build its pool and
    /// scheduler. Nothing runs until [`start_pool`](Self::start_pool).
    pub async fn create_pool(&self, target: MonitorTarget) -> WorkerResult<PoolHandle> {
        let policy_id = target.policy_id;
        if self.live_runtime(policy_id).is_some() {
            return Err(WorkerError::PoolAlreadyExists(policy_id));
        }
        match self.inner.persistor.get_pool_state(policy_id).await? {
            Some(state) if state.pool_status == LifecycleStatus::Archived => {
                return Err(WorkerError::PoolArchived(policy_id));
            }
            Some(_) => return Err(WorkerError::PoolAlreadyExists(policy_id)),
            None => {}
        }

        let defaults = &self.inner.defaults;
        let pool_state = WorkerPoolState::new(&target, defaults.num_workers, defaults.job_timeout);
        let scheduler_state = WorkerSchedulerState::new(&target);
        self.inner
            .persistor
            .create_infrastructure(&pool_state, &scheduler_state)
            .await?;

        let runtime = self.build_runtime(target, &pool_state, &scheduler_state);
        self.insert_runtime(policy_id, runtime)?;

        info!(
            policy_id = %policy_id,
            pool_name = %pool_state.pool_name,
            num_workers = pool_state.num_workers,
            "worker pool created"
        );
        Ok(PoolHandle {
            policy_id,
            pool_name: pool_state.pool_name,
        })
    }

    /// Mark both rows `active` and start workers and scheduler. A pool that
    /// was stopped in this process is rebuilt from its persisted rows.
    pub async fn start_pool(&self, policy_id: PolicyId) -> WorkerResult<PoolHandle> {
        let (pool_state, scheduler_state) = self.load_rows(policy_id).await?;
        check_transition("pool", policy_id, pool_state.pool_status, LifecycleStatus::Active)?;
        check_transition(
            "scheduler",
            policy_id,
            scheduler_state.scheduler_status,
            LifecycleStatus::Active,
        )?;

        let runtime = match self.live_runtime(policy_id) {
            Some(runtime) => runtime,
            None => {
                let target = self.inner.policies.monitor_target(policy_id).await?;
                let runtime = self.build_runtime(target, &pool_state, &scheduler_state);
                self.insert_runtime(policy_id, runtime.clone())?;
                runtime
            }
        };

        let now = Utc::now();
        self.inner
            .persistor
            .set_pool_status(policy_id, LifecycleStatus::Active, now)
            .await?;
        self.inner
            .persistor
            .set_scheduler_status(policy_id, LifecycleStatus::Active, now)
            .await?;

        runtime.pool.start();
        runtime.scheduler.start(runtime.resume_from);

        info!(
            policy_id = %policy_id,
            pool_name = %pool_state.pool_name,
            "worker pool active"
        );
        Ok(PoolHandle {
            policy_id,
            pool_name: pool_state.pool_name,
        })
    }

    /// Rebuild a policy's runtime from whatever rows exist and start it.
    /// Missing rows are created; a half-written pair is replaced.
    pub async fn recover_pool(&self, target: MonitorTarget) -> WorkerResult<PoolHandle> {
        let policy_id = target.policy_id;
        if self.live_runtime(policy_id).is_some() {
            return Err(WorkerError::PoolAlreadyExists(policy_id));
        }

        let persistor = &self.inner.persistor;
        let pool_state = persistor.get_pool_state(policy_id).await?;
        let scheduler_state = persistor.get_scheduler_state(policy_id).await?;

        let archived = pool_state
            .as_ref()
            .is_some_and(|p| p.pool_status == LifecycleStatus::Archived)
            || scheduler_state
                .as_ref()
                .is_some_and(|s| s.scheduler_status == LifecycleStatus::Archived);
        if archived {
            return Err(WorkerError::PoolArchived(policy_id));
        }

        let (pool_state, scheduler_state) = match (pool_state, scheduler_state) {
            (Some(pool), Some(scheduler)) => (pool, scheduler),
            (pool, scheduler) => {
                if pool.is_some() || scheduler.is_some() {
                    warn!(policy_id = %policy_id, "partial worker state, recreating rows");
                    persistor.delete_infrastructure(policy_id).await?;
                }
                let defaults = &self.inner.defaults;
                let pool = WorkerPoolState::new(&target, defaults.num_workers, defaults.job_timeout);
                let scheduler = WorkerSchedulerState::new(&target);
                persistor.create_infrastructure(&pool, &scheduler).await?;
                (pool, scheduler)
            }
        };

        let runtime = self.build_runtime(target, &pool_state, &scheduler_state);
        self.insert_runtime(policy_id, runtime)?;
        self.start_pool(policy_id).await
    }

    /// Stop the scheduler, drain the pool, and persist `stopped`.
    pub async fn stop_pool(&self, policy_id: PolicyId) -> WorkerResult<()> {
        let runtime = self.runtime(policy_id);
        if runtime.is_none() && self.inner.persistor.get_pool_state(policy_id).await?.is_none() {
            return Err(WorkerError::PoolNotFound(policy_id));
        }

        if let Some(runtime) = runtime {
            runtime.scheduler.stop().await;
            runtime.pool.stop().await;
        }
        self.persist_stopped(policy_id).await?;

        info!(policy_id = %policy_id, "worker pool stopped");
        Ok(())
    }

    /// Stop if needed, then archive both rows and forget the runtime.
    pub async fn archive_pool(&self, policy_id: PolicyId) -> WorkerResult<()> {
        let state = self
            .inner
            .persistor
            .get_pool_state(policy_id)
            .await?
            .ok_or(WorkerError::PoolNotFound(policy_id))?;

        if state.pool_status != LifecycleStatus::Archived {
            self.stop_pool(policy_id).await?;
            let now = Utc::now();
            self.inner
                .persistor
                .set_pool_status(policy_id, LifecycleStatus::Archived, now)
                .await?;
            let scheduler = self.inner.persistor.get_scheduler_state(policy_id).await?;
            if scheduler.is_some_and(|s| s.scheduler_status != LifecycleStatus::Archived) {
                self.inner
                    .persistor
                    .set_scheduler_status(policy_id, LifecycleStatus::Archived, now)
                    .await?;
            }
        }

        self.inner
            .runtimes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&policy_id);

        info!(policy_id = %policy_id, "worker pool archived");
        Ok(())
    }

    /// Stop every pool, scheduler, and the AI pool. In-flight jobs get
    /// `shutdown_grace` to finish; `stopped` is persisted before returning.
    pub async fn shutdown(&self) {
        let runtimes: Vec<(PolicyId, PolicyRuntime)> = self
            .inner
            .runtimes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        info!(pools = runtimes.len(), "shutting down worker pools");

        let root = self.inner.root.clone();
        let grace = self.inner.defaults.shutdown_grace;
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            warn!("shutdown grace elapsed, forcing stop");
            root.cancel();
        });

        let stops = runtimes.iter().map(|(_, runtime)| async move {
            runtime.scheduler.stop().await;
            runtime.pool.stop().await;
        });
        futures::join!(
            futures::future::join_all(stops),
            self.inner.ai_pool.stop()
        );
        deadline.abort();

        for (policy_id, _) in &runtimes {
            if let Err(e) = self.persist_stopped(*policy_id).await {
                error!(policy_id = %policy_id, error = %e, "failed to persist stopped state");
            }
        }
        self.inner.root.cancel();
        info!("worker pools shut down");
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submit an ad-hoc job to a policy's queue.
    pub async fn enqueue(
        &self,
        policy_id: PolicyId,
        payload: JobPayload,
    ) -> WorkerResult<JobExecutionId> {
        let runtime = self
            .live_runtime(policy_id)
            .ok_or(WorkerError::PoolNotFound(policy_id))?;
        runtime.pool.enqueue(payload).await
    }

    pub fn ai_pool(&self) -> Arc<WorkerPool> {
        self.inner.ai_pool.clone()
    }

    pub async fn submit_ai_job(&self, payload: JobPayload) -> WorkerResult<JobExecutionId> {
        self.inner.ai_pool.enqueue(payload).await
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn handle_for(&self, policy_id: PolicyId) -> Option<PoolHandle> {
        self.runtime(policy_id).map(|runtime| PoolHandle {
            policy_id,
            pool_name: runtime.pool.name().to_string(),
        })
    }

    pub fn is_running(&self, policy_id: PolicyId) -> bool {
        self.live_runtime(policy_id)
            .is_some_and(|runtime| runtime.pool.is_started())
    }

    pub fn running_policy_ids(&self) -> Vec<PolicyId> {
        self.inner
            .runtimes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, runtime)| !runtime.pool.is_stopped())
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn pool_status(&self, policy_id: PolicyId) -> WorkerResult<Option<PoolStatus>> {
        match self.inner.persistor.get_pool_state(policy_id).await? {
            Some(pool) => Ok(Some(self.status_for(pool).await?)),
            None => Ok(None),
        }
    }

    pub async fn pool_statuses(&self) -> WorkerResult<Vec<PoolStatus>> {
        let pools = self.inner.persistor.list_pool_states(None).await?;
        let mut statuses = Vec::with_capacity(pools.len());
        for pool in pools {
            statuses.push(self.status_for(pool).await?);
        }
        Ok(statuses)
    }

    async fn status_for(&self, pool: WorkerPoolState) -> WorkerResult<PoolStatus> {
        let scheduler = self
            .inner
            .persistor
            .get_scheduler_state(pool.policy_id)
            .await?;
        let runtime = self.runtime(pool.policy_id);
        Ok(PoolStatus {
            runtime: runtime.as_ref().map(|r| r.pool.snapshot()),
            scheduler_running: runtime.is_some_and(|r| r.scheduler.is_running()),
            pool,
            scheduler,
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn runtime(&self, policy_id: PolicyId) -> Option<PolicyRuntime> {
        self.inner
            .runtimes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&policy_id)
            .cloned()
    }

    /// The runtime, unless it has already been stopped.
    fn live_runtime(&self, policy_id: PolicyId) -> Option<PolicyRuntime> {
        self.runtime(policy_id)
            .filter(|runtime| !runtime.pool.is_stopped())
    }

    fn insert_runtime(&self, policy_id: PolicyId, runtime: PolicyRuntime) -> WorkerResult<()> {
        let mut runtimes = self
            .inner
            .runtimes
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if runtimes
            .get(&policy_id)
            .is_some_and(|existing| !existing.pool.is_stopped())
        {
            return Err(WorkerError::PoolAlreadyExists(policy_id));
        }
        runtimes.insert(policy_id, runtime);
        Ok(())
    }

    fn build_runtime(
        &self,
        target: MonitorTarget,
        pool_state: &WorkerPoolState,
        scheduler_state: &WorkerSchedulerState,
    ) -> PolicyRuntime {
        let inner = &self.inner;
        let executor = Arc::new(JobExecutor::new(
            inner.registry.clone(),
            inner.persistor.clone(),
            pool_state.job_timeout(),
            inner.defaults.backoff,
        ));
        let pool = WorkerPool::new(
            PoolOptions {
                name: pool_state.pool_name.clone(),
                policy_id: Some(pool_state.policy_id),
                num_workers: pool_state.worker_count(),
                queue_capacity: inner.defaults.queue_capacity,
                grace: inner.defaults.shutdown_grace,
            },
            executor,
            inner.root.child_token(),
        );
        let scheduler = PolicyScheduler::new(
            target,
            scheduler_state.monitor_interval(),
            inner.defaults.max_retries,
            inner.persistor.clone(),
            inner.policies.clone(),
            pool.clone(),
            inner.retire_tx.clone(),
            inner.root.child_token(),
        );
        PolicyRuntime {
            pool,
            scheduler,
            resume_from: scheduler_state.next_run_at,
        }
    }

    async fn load_rows(
        &self,
        policy_id: PolicyId,
    ) -> WorkerResult<(WorkerPoolState, WorkerSchedulerState)> {
        let pool = self
            .inner
            .persistor
            .get_pool_state(policy_id)
            .await?
            .ok_or(WorkerError::PoolNotFound(policy_id))?;
        let scheduler = self
            .inner
            .persistor
            .get_scheduler_state(policy_id)
            .await?
            .ok_or(WorkerError::PoolNotFound(policy_id))?;
        Ok((pool, scheduler))
    }

    /// Move both rows to `stopped`. A scheduler that already archived itself
    /// is left alone.
    async fn persist_stopped(&self, policy_id: PolicyId) -> WorkerResult<()> {
        let persistor = &self.inner.persistor;
        let now = Utc::now();

        if let Some(pool) = persistor.get_pool_state(policy_id).await? {
            if pool.pool_status != LifecycleStatus::Stopped {
                check_transition("pool", policy_id, pool.pool_status, LifecycleStatus::Stopped)?;
                persistor
                    .set_pool_status(policy_id, LifecycleStatus::Stopped, now)
                    .await?;
            }
        }
        if let Some(scheduler) = persistor.get_scheduler_state(policy_id).await? {
            match scheduler.scheduler_status {
                LifecycleStatus::Stopped | LifecycleStatus::Archived => {}
                status => {
                    check_transition("scheduler", policy_id, status, LifecycleStatus::Stopped)?;
                    persistor
                        .set_scheduler_status(policy_id, LifecycleStatus::Stopped, now)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// Archives pools whose scheduler found the policy no longer active.
fn spawn_reaper(inner: Weak<ManagerInner>, mut retire_rx: mpsc::UnboundedReceiver<PolicyId>) {
    tokio::spawn(async move {
        while let Some(policy_id) = retire_rx.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            let manager = WorkerPoolManager { inner };
            match manager.archive_pool(policy_id).await {
                Ok(()) => info!(policy_id = %policy_id, "retired worker pool of inactive policy"),
                Err(e) => warn!(policy_id = %policy_id, error = %e, "failed to retire worker pool"),
            }
        }
    });
}
