//! Worker pool lifecycle and startup recovery, run against the in-memory
//! persistor.
//!
//! - create/start/stop/archive transitions and their persisted rows
//! - duplicate creation is rejected
//! - recovery brings up exactly one pool per active policy
//! - periodic adoption starts newly active policies and leaves live ones alone
//! - an overdue scheduler fires once on recovery, not once per missed tick

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use policy_monitor_core::common::{BasePolicyId, FarmId, FrequencyUnit, MonitorCadence, PolicyId};
use policy_monitor_core::kernel::jobs::testing::{
    wait_until, InMemoryWorkerPersistor, MockJobHandler, StaticPolicySource,
};
use policy_monitor_core::kernel::jobs::{
    JobHandlerRegistry, JobPayload, JobStatus, JobType, LifecycleStatus, MonitorTarget,
    RecoveryManager, RetryBackoff, WorkerDefaults, WorkerError, WorkerPersistor,
    WorkerJobExecution, WorkerPoolManager, WorkerPoolState, WorkerSchedulerState,
    ABANDONED_MESSAGE,
};
use policy_monitor_core::kernel::{start_scheduler, TestDependencies, DEFAULT_CLAIM_SWEEP_CRON};

struct Fixture {
    persistor: Arc<InMemoryWorkerPersistor>,
    policies: Arc<StaticPolicySource>,
    handler: Arc<MockJobHandler>,
    manager: WorkerPoolManager,
}

impl Fixture {
    fn new() -> Self {
        Self::with_handler(MockJobHandler::new().into_arc())
    }

    fn with_handler(handler: Arc<MockJobHandler>) -> Self {
        let persistor = Arc::new(InMemoryWorkerPersistor::new());
        let policies = Arc::new(StaticPolicySource::new());
        let registry = Arc::new(JobHandlerRegistry::new());
        registry.register(JobType::FetchFarmMonitoringData, handler.clone());
        registry.register(JobType::FarmImagery, handler.clone());

        let defaults = WorkerDefaults::builder()
            .num_workers(2usize)
            .job_timeout(Duration::from_secs(2))
            .backoff(RetryBackoff::new(
                Duration::from_millis(5),
                Duration::from_millis(20),
            ))
            .shutdown_grace(Duration::from_millis(200))
            .ai_pool_workers(1usize)
            .build();
        let manager = WorkerPoolManager::new(
            persistor.clone(),
            registry,
            policies.clone(),
            defaults,
        );

        Self {
            persistor,
            policies,
            handler,
            manager,
        }
    }

    fn add_policy(&self) -> MonitorTarget {
        let target = daily_target();
        self.policies.add_active(target.clone());
        target
    }

    fn fetches_for(&self, policy_id: PolicyId) -> Vec<WorkerJobExecution> {
        self.persistor
            .executions()
            .into_iter()
            .filter(|e| e.policy_id == Some(policy_id))
            .collect()
    }
}

fn daily_target() -> MonitorTarget {
    MonitorTarget::builder()
        .policy_id(PolicyId::new())
        .base_policy_id(BasePolicyId::new())
        .farm_id(FarmId::new())
        .cadence(MonitorCadence::new(1, FrequencyUnit::Day))
        .lookback_days(7)
        .build()
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn create_persists_created_rows_without_running() {
    let fx = Fixture::new();
    let target = fx.add_policy();

    let handle = fx.manager.create_pool(target.clone()).await.unwrap();
    assert_eq!(handle.pool_name, format!("policy-{}-pool", target.policy_id));

    let pool = fx.persistor.get_pool_state(target.policy_id).await.unwrap().unwrap();
    let scheduler = fx
        .persistor
        .get_scheduler_state(target.policy_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pool.pool_status, LifecycleStatus::Created);
    assert_eq!(scheduler.scheduler_status, LifecycleStatus::Created);
    assert_eq!(scheduler.monitor_interval(), Duration::from_secs(24 * 3600));
    assert!(!fx.manager.is_running(target.policy_id));
    assert_eq!(fx.handler.calls(), 0);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let fx = Fixture::new();
    let target = fx.add_policy();

    fx.manager.create_pool(target.clone()).await.unwrap();
    let err = fx.manager.create_pool(target.clone()).await.unwrap_err();

    assert!(matches!(err, WorkerError::PoolAlreadyExists(id) if id == target.policy_id));
    assert_eq!(fx.persistor.pool_count(), 1);
    fx.manager.shutdown().await;
}

#[tokio::test]
async fn start_runs_first_fetch_immediately() {
    let fx = Fixture::new();
    let target = fx.add_policy();

    fx.manager.create_pool(target.clone()).await.unwrap();
    fx.manager.start_pool(target.policy_id).await.unwrap();
    assert!(fx.manager.is_running(target.policy_id));

    assert!(
        wait_until(Duration::from_secs(2), || {
            fx.fetches_for(target.policy_id)
                .iter()
                .any(|e| e.status == JobStatus::Completed)
        })
        .await
    );

    let executions = fx.fetches_for(target.policy_id);
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].job_type, JobType::FetchFarmMonitoringData);

    let pool = fx.persistor.get_pool_state(target.policy_id).await.unwrap().unwrap();
    assert_eq!(pool.pool_status, LifecycleStatus::Active);
    assert!(pool.started_at.is_some());

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn ad_hoc_jobs_run_on_the_policy_pool() {
    let fx = Fixture::new();
    let target = fx.add_policy();
    let unknown = PolicyId::new();

    fx.manager.create_pool(target.clone()).await.unwrap();
    fx.manager.start_pool(target.policy_id).await.unwrap();

    let id = fx
        .manager
        .enqueue(
            target.policy_id,
            JobPayload::builder()
                .job_type(JobType::FetchFarmMonitoringData)
                .build(),
        )
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            fx.fetches_for(target.policy_id)
                .iter()
                .any(|e| e.id == id && e.status == JobStatus::Completed)
        })
        .await
    );

    let err = fx
        .manager
        .enqueue(
            unknown,
            JobPayload::builder()
                .job_type(JobType::FetchFarmMonitoringData)
                .build(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::PoolNotFound(p) if p == unknown));

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn stop_then_archive_persists_each_state() {
    let fx = Fixture::new();
    let target = fx.add_policy();
    let policy_id = target.policy_id;

    fx.manager.create_pool(target).await.unwrap();
    fx.manager.start_pool(policy_id).await.unwrap();

    fx.manager.stop_pool(policy_id).await.unwrap();
    let pool = fx.persistor.get_pool_state(policy_id).await.unwrap().unwrap();
    assert_eq!(pool.pool_status, LifecycleStatus::Stopped);
    assert!(pool.stopped_at.is_some());
    assert!(!fx.manager.is_running(policy_id));

    let err = fx
        .manager
        .enqueue(
            policy_id,
            JobPayload::builder()
                .job_type(JobType::FetchFarmMonitoringData)
                .build(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkerError::PoolNotFound(_) | WorkerError::QueueClosed(_)
    ));

    fx.manager.archive_pool(policy_id).await.unwrap();
    let pool = fx.persistor.get_pool_state(policy_id).await.unwrap().unwrap();
    let scheduler = fx.persistor.get_scheduler_state(policy_id).await.unwrap().unwrap();
    assert_eq!(pool.pool_status, LifecycleStatus::Archived);
    assert_eq!(scheduler.scheduler_status, LifecycleStatus::Archived);
    assert!(fx.manager.handle_for(policy_id).is_none());

    let err = fx.manager.start_pool(policy_id).await.unwrap_err();
    assert!(matches!(err, WorkerError::InvalidTransition { .. }));

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn stopped_pool_can_restart() {
    let fx = Fixture::new();
    let target = fx.add_policy();
    let policy_id = target.policy_id;

    fx.manager.create_pool(target).await.unwrap();
    fx.manager.start_pool(policy_id).await.unwrap();
    fx.manager.stop_pool(policy_id).await.unwrap();
    fx.manager.start_pool(policy_id).await.unwrap();

    assert!(fx.manager.is_running(policy_id));
    let pool = fx.persistor.get_pool_state(policy_id).await.unwrap().unwrap();
    assert_eq!(pool.pool_status, LifecycleStatus::Active);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_persists_stopped_for_every_pool() {
    let fx = Fixture::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let target = fx.add_policy();
        ids.push(target.policy_id);
        fx.manager.create_pool(target.clone()).await.unwrap();
        fx.manager.start_pool(target.policy_id).await.unwrap();
    }

    fx.manager.shutdown().await;

    for id in ids {
        let pool = fx.persistor.get_pool_state(id).await.unwrap().unwrap();
        let scheduler = fx.persistor.get_scheduler_state(id).await.unwrap().unwrap();
        assert_eq!(pool.pool_status, LifecycleStatus::Stopped);
        assert_eq!(scheduler.scheduler_status, LifecycleStatus::Stopped);
    }
    assert!(fx.manager.running_policy_ids().is_empty());
}

// =============================================================================
// AI pool
// =============================================================================

#[tokio::test]
async fn ai_job_retries_transient_failures() {
    let fx = Fixture::with_handler(MockJobHandler::failing_transiently(2).into_arc());

    let id = fx
        .manager
        .submit_ai_job(
            JobPayload::builder()
                .job_type(JobType::FarmImagery)
                .params(serde_json::json!({ "farm_id": "farm-1" }))
                .build(),
        )
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            fx.persistor
                .executions_with_status(JobStatus::Completed)
                .iter()
                .any(|e| e.id == id)
        })
        .await
    );

    let row = fx
        .persistor
        .executions()
        .into_iter()
        .find(|e| e.id == id)
        .unwrap();
    assert_eq!(row.retry_count, 2);
    assert!(row.policy_id.is_none());
    assert_eq!(fx.handler.attempts(), vec![1, 2, 3]);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn ai_job_permanent_failure_is_not_retried() {
    let fx = Fixture::with_handler(MockJobHandler::failing_permanently().into_arc());

    let id = fx
        .manager
        .submit_ai_job(JobPayload::builder().job_type(JobType::FarmImagery).build())
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            fx.persistor
                .executions_with_status(JobStatus::Failed)
                .iter()
                .any(|e| e.id == id)
        })
        .await
    );
    assert_eq!(fx.handler.calls(), 1);

    fx.manager.shutdown().await;
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn recovery_creates_one_pool_per_active_policy() {
    let fx = Fixture::new();
    let a = fx.add_policy();
    let b = fx.add_policy();
    let inactive = fx.add_policy();
    fx.policies.set_active(inactive.policy_id, false);

    let report = RecoveryManager::new(fx.manager.clone(), fx.policies.clone())
        .recover_active_policies()
        .await
        .unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.recovered, 2);
    assert!(report.failed.is_empty());
    assert_eq!(fx.persistor.pool_count(), 2);
    for id in [a.policy_id, b.policy_id] {
        assert!(fx.manager.is_running(id));
        let pool = fx.persistor.get_pool_state(id).await.unwrap().unwrap();
        assert_eq!(pool.pool_status, LifecycleStatus::Active);
    }
    assert!(fx
        .persistor
        .get_pool_state(inactive.policy_id)
        .await
        .unwrap()
        .is_none());

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn recovery_after_restart_reuses_existing_rows() {
    let fx = Fixture::new();
    let target = fx.add_policy();
    fx.manager.create_pool(target.clone()).await.unwrap();
    fx.manager.start_pool(target.policy_id).await.unwrap();
    fx.manager.shutdown().await;

    // A new process over the same state
    let registry = Arc::new(JobHandlerRegistry::new());
    registry.register(JobType::FetchFarmMonitoringData, fx.handler.clone());
    let restarted = WorkerPoolManager::new(
        fx.persistor.clone(),
        registry,
        fx.policies.clone(),
        WorkerDefaults::default(),
    );
    let report = RecoveryManager::new(restarted.clone(), fx.policies.clone())
        .recover_active_policies()
        .await
        .unwrap();

    assert_eq!(report.recovered, 1);
    assert_eq!(fx.persistor.pool_count(), 1);
    assert!(restarted.is_running(target.policy_id));

    restarted.shutdown().await;
}

#[tokio::test]
async fn recovery_fails_abandoned_executions() {
    let fx = Fixture::new();
    let target = fx.add_policy();

    let payload = JobPayload::builder()
        .job_type(JobType::FetchFarmMonitoringData)
        .build();
    let mut orphan = WorkerJobExecution::pending(Some(target.policy_id), &payload);
    orphan.status = JobStatus::Running;
    orphan.started_at = Some(Utc::now());
    fx.persistor.insert_execution(orphan.clone());

    let report = RecoveryManager::new(fx.manager.clone(), fx.policies.clone())
        .recover_active_policies()
        .await
        .unwrap();
    assert_eq!(report.abandoned_jobs, 1);

    let row = fx
        .persistor
        .executions()
        .into_iter()
        .find(|e| e.id == orphan.id)
        .unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some(ABANDONED_MESSAGE));

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn recovery_fails_abandoned_ai_jobs() {
    let fx = Fixture::new();

    let payload = JobPayload::builder().job_type(JobType::FarmImagery).build();
    let mut orphan = WorkerJobExecution::pending(None, &payload);
    orphan.status = JobStatus::Running;
    orphan.started_at = Some(Utc::now());
    fx.persistor.insert_execution(orphan.clone());

    let report = RecoveryManager::new(fx.manager.clone(), fx.policies.clone())
        .recover_active_policies()
        .await
        .unwrap();
    assert_eq!(report.total, 0);
    assert_eq!(report.abandoned_jobs, 1);

    let row = fx
        .persistor
        .executions()
        .into_iter()
        .find(|e| e.id == orphan.id)
        .unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some(ABANDONED_MESSAGE));

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn adoption_starts_policies_activated_later() {
    let fx = Fixture::new();
    let first = fx.add_policy();
    let recovery = RecoveryManager::new(fx.manager.clone(), fx.policies.clone());
    recovery.recover_active_policies().await.unwrap();
    assert!(fx.manager.is_running(first.policy_id));

    // Work in flight on the live pool must survive later passes
    let payload = JobPayload::builder()
        .job_type(JobType::FetchFarmMonitoringData)
        .build();
    let mut in_flight = WorkerJobExecution::pending(Some(first.policy_id), &payload);
    in_flight.status = JobStatus::Running;
    in_flight.started_at = Some(Utc::now());
    fx.persistor.insert_execution(in_flight.clone());

    let second = fx.add_policy();
    let report = recovery.adopt_active_policies().await.unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.already_running, 1);
    assert_eq!(report.abandoned_jobs, 0);
    assert!(fx.manager.is_running(second.policy_id));

    let again = recovery.adopt_active_policies().await.unwrap();
    assert_eq!(again.recovered, 0);
    assert_eq!(again.already_running, 2);
    assert_eq!(fx.persistor.pool_count(), 2);

    let row = fx
        .persistor
        .executions()
        .into_iter()
        .find(|e| e.id == in_flight.id)
        .unwrap();
    assert_eq!(row.status, JobStatus::Running);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn adoption_stops_pools_of_deactivated_policies() {
    let fx = Fixture::new();
    let target = fx.add_policy();
    let recovery = RecoveryManager::new(fx.manager.clone(), fx.policies.clone());
    recovery.recover_active_policies().await.unwrap();
    assert!(fx.manager.is_running(target.policy_id));

    fx.policies.set_active(target.policy_id, false);
    let report = recovery.adopt_active_policies().await.unwrap();

    assert_eq!(report.reconciled, 1);
    assert!(!fx.manager.is_running(target.policy_id));
    let pool = fx
        .persistor
        .get_pool_state(target.policy_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pool.pool_status, LifecycleStatus::Stopped);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn adoption_cron_picks_up_new_policy() {
    let fx = Fixture::new();
    let deps = TestDependencies::new();
    let recovery = Arc::new(RecoveryManager::new(fx.manager.clone(), fx.policies.clone()));
    let mut cron = start_scheduler(
        Arc::new(deps.deps().claim_lifecycle()),
        DEFAULT_CLAIM_SWEEP_CRON,
        recovery,
        "* * * * * *",
    )
    .await
    .unwrap();

    let target = fx.add_policy();
    assert!(
        wait_until(Duration::from_secs(5), || fx.manager.is_running(target.policy_id)).await
    );
    assert_eq!(fx.persistor.pool_count(), 1);

    cron.shutdown().await.unwrap();
    fx.manager.shutdown().await;
}

#[tokio::test]
async fn recovery_stops_pools_of_inactive_policies() {
    let fx = Fixture::new();
    let target = fx.add_policy();
    let mut pool = WorkerPoolState::new(&target, 2, Duration::from_secs(60));
    let mut scheduler = WorkerSchedulerState::new(&target);
    pool.pool_status = LifecycleStatus::Active;
    scheduler.scheduler_status = LifecycleStatus::Active;
    fx.persistor.insert_rows(pool, scheduler);
    fx.policies.set_active(target.policy_id, false);

    let report = RecoveryManager::new(fx.manager.clone(), fx.policies.clone())
        .recover_active_policies()
        .await
        .unwrap();

    assert_eq!(report.total, 0);
    assert_eq!(report.reconciled, 1);
    let pool = fx
        .persistor
        .get_pool_state(target.policy_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pool.pool_status, LifecycleStatus::Stopped);

    fx.manager.shutdown().await;
}

#[tokio::test]
async fn overdue_scheduler_catches_up_with_one_run() {
    let fx = Fixture::new();
    let target = fx.add_policy();
    let ten_days_ago = Utc::now() - chrono::Duration::days(10);

    let mut pool = WorkerPoolState::new(&target, 2, Duration::from_secs(60));
    let mut scheduler = WorkerSchedulerState::new(&target);
    pool.pool_status = LifecycleStatus::Stopped;
    scheduler.scheduler_status = LifecycleStatus::Stopped;
    scheduler.last_run_at = Some(ten_days_ago - chrono::Duration::days(1));
    scheduler.next_run_at = Some(ten_days_ago);
    scheduler.run_count = 5;
    fx.persistor.insert_rows(pool, scheduler);

    RecoveryManager::new(fx.manager.clone(), fx.policies.clone())
        .recover_active_policies()
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            fx.fetches_for(target.policy_id).len() == 1
        })
        .await
    );
    // Ten missed days must not turn into ten fetches
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fx.fetches_for(target.policy_id).len(), 1);

    let scheduler = fx
        .persistor
        .get_scheduler_state(target.policy_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(scheduler.run_count, 6);
    assert!(scheduler.next_run_at.unwrap() > Utc::now());

    fx.manager.shutdown().await;
}
