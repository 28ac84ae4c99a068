//! Integration tests against a real Postgres (testcontainers).
//!
//! The shared database outlives each test, so every test builds its own
//! policy and only looks at rows it owns.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use policy_monitor_core::common::{FrequencyUnit, MonitorCadence};
use policy_monitor_core::domains::claims::{
    Claim, ClaimStatus, ClaimStore, EvaluationRecord, PayoutStatus, PostgresClaimStore,
};
use policy_monitor_core::domains::monitoring::{
    FarmMonitoringData, MonitoringStore, PostgresMonitoringStore,
};
use policy_monitor_core::domains::policies::{PolicyCatalog, PolicyStatus, PostgresPolicyCatalog};
use policy_monitor_core::domains::triggers::ConditionStreak;
use policy_monitor_core::kernel::jobs::{
    JobHandler, JobType, LifecycleStatus, MonitorTarget, PostgresWorkerPersistor, WorkerError,
    WorkerPersistor, WorkerPoolState, WorkerSchedulerState,
};
use policy_monitor_core::kernel::{MockDataProvider, MonitorDeps, SeriesPoint};
use test_context::test_context;

use crate::common::{daily_readings, insert_claim, job_context, DroughtPolicy, TestHarness};

fn deps_with_series(ctx: &TestHarness, fx: &DroughtPolicy, values: &[f64]) -> MonitorDeps {
    let provider = MockDataProvider::new()
        .with_series(fx.source.id, &daily_readings(Utc::now(), values));
    MonitorDeps::postgres(ctx.db_pool.clone(), Arc::new(provider))
}

// =============================================================================
// Catalog
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn catalog_loads_monitoring_plan(ctx: &TestHarness) {
    let fx = DroughtPolicy::new();
    fx.insert(&ctx.db_pool).await.unwrap();
    let catalog = PostgresPolicyCatalog::new(ctx.db_pool.clone());

    let plan = catalog.load_monitoring_plan(fx.policy.id).await.unwrap();

    assert_eq!(plan.policy.id, fx.policy.id);
    assert_eq!(plan.triggers.len(), 1);
    assert_eq!(plan.triggers[0].conditions.len(), 1);
    assert_eq!(plan.lookback_days(), 7);
    assert!(plan.data_sources.contains_key(&fx.source.id));

    let target = plan.monitor_target();
    assert_eq!(target.cadence.to_duration(), std::time::Duration::from_secs(86_400));
    assert_eq!(target.parameters.len(), 1);
    assert!(catalog
        .active_policy_ids()
        .await
        .unwrap()
        .contains(&fx.policy.id));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn inactive_policies_are_not_listed(ctx: &TestHarness) {
    let fx = DroughtPolicy::with_status(PolicyStatus::Expired);
    fx.insert(&ctx.db_pool).await.unwrap();
    let catalog = PostgresPolicyCatalog::new(ctx.db_pool.clone());

    assert!(!catalog
        .active_policy_ids()
        .await
        .unwrap()
        .contains(&fx.policy.id));
    assert_eq!(
        catalog.policy_status(fx.policy.id).await.unwrap(),
        Some(PolicyStatus::Expired)
    );
}

// =============================================================================
// Fetch handler
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn fetch_generates_then_suppresses_claim(ctx: &TestHarness) {
    let fx = DroughtPolicy::new();
    fx.insert(&ctx.db_pool).await.unwrap();
    let deps = deps_with_series(ctx, &fx, &[1.0; 7]);
    let handler = deps.fetch_handler();
    let job = job_context(JobType::FetchFarmMonitoringData, fx.policy.id);

    let first = handler.execute(&job, &fx.fetch_params()).await.unwrap();
    let second = handler.execute(&job, &fx.fetch_params()).await.unwrap();

    assert_eq!(first["claims_generated"].as_array().unwrap().len(), 1);
    assert!(second["claims_generated"].as_array().unwrap().is_empty());
    assert_eq!(second["measurements_inserted"], 0);

    let claims: Vec<Claim> =
        sqlx::query_as("SELECT * FROM claims WHERE registered_policy_id = $1")
            .bind(fx.policy.id)
            .fetch_all(&ctx.db_pool)
            .await
            .unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].status, ClaimStatus::Generated);
    assert!(claims[0].auto_generated);
    assert!(claims[0].auto_approval_deadline.unwrap() > Utc::now());

    let logs = deps.claims.evaluation_logs(fx.policy.id, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs.iter().filter(|l| l.claim_generated).count(), 1);
    let suppressed = logs.iter().find(|l| !l.claim_generated).unwrap();
    assert_eq!(suppressed.suppressed_by(), Some(claims[0].id));

    let stored: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM farm_monitoring_data WHERE farm_id = $1")
            .bind(fx.policy.farm_id)
            .fetch_one(&ctx.db_pool)
            .await
            .unwrap();
    assert_eq!(stored, 7);
}

// =============================================================================
// Claim store
// =============================================================================

fn streak_for(fx: &DroughtPolicy, count: i32) -> ConditionStreak {
    ConditionStreak {
        registered_policy_id: fx.policy.id,
        condition_id: fx.condition.id,
        streak_count: count,
        streak_started_at: Some(Utc::now()),
        last_evaluated_at: Utc::now(),
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn claim_log_and_streaks_commit_together(ctx: &TestHarness) {
    let fx = DroughtPolicy::new();
    fx.insert(&ctx.db_pool).await.unwrap();
    let store = PostgresClaimStore::new(ctx.db_pool.clone());
    let since = Utc::now() - Duration::days(7);

    let first = fx.claim(ClaimStatus::Generated, None);
    let log = fx.fired_log();
    let open = store
        .record_evaluation(&EvaluationRecord {
            log: log.clone(),
            streaks: vec![streak_for(&fx, 1)],
            candidate: Some((first.clone(), since)),
        })
        .await
        .unwrap();
    assert!(open.is_none());

    // Same claim number, checked past the first claim: the insert fails,
    // so neither the log nor the streak may land
    let mut clash = fx.claim(ClaimStatus::Generated, None);
    clash.claim_number = first.claim_number.clone();
    assert!(store
        .record_evaluation(&EvaluationRecord {
            log: fx.fired_log(),
            streaks: vec![streak_for(&fx, 5)],
            candidate: Some((clash.clone(), Utc::now() + Duration::hours(1))),
        })
        .await
        .is_err());

    let logs = store.evaluation_logs(fx.policy.id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].id, log.id);
    assert_eq!(logs[0].claim_id, Some(first.id));
    assert!(store.find_claim(clash.id).await.unwrap().is_none());
    let streaks = store.streaks(fx.policy.id).await.unwrap();
    assert_eq!(streaks.len(), 1);
    assert_eq!(streaks[0].streak_count, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_evaluations_raise_one_claim(ctx: &TestHarness) {
    let fx = DroughtPolicy::new();
    fx.insert(&ctx.db_pool).await.unwrap();
    let store = PostgresClaimStore::new(ctx.db_pool.clone());
    let since = Utc::now() - Duration::days(7);

    let record = |claim: Claim| EvaluationRecord {
        log: fx.fired_log(),
        streaks: vec![],
        candidate: Some((claim, since)),
    };
    let (a, b) = (
        record(fx.claim(ClaimStatus::Generated, None)),
        record(fx.claim(ClaimStatus::Generated, None)),
    );
    let (ra, rb) = tokio::join!(store.record_evaluation(&a), store.record_evaluation(&b));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    // Exactly one side saw the other's claim
    assert!(ra.is_some() != rb.is_some());
    let claims: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM claims WHERE registered_policy_id = $1")
            .bind(fx.policy.id)
            .fetch_one(&ctx.db_pool)
            .await
            .unwrap();
    assert_eq!(claims, 1);

    let logs = store.evaluation_logs(fx.policy.id, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs.iter().filter(|l| l.claim_generated).count(), 1);
    assert_eq!(logs.iter().filter(|l| l.suppressed_by().is_some()).count(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn open_claim_lookup_ignores_closed_and_old_claims(ctx: &TestHarness) {
    let fx = DroughtPolicy::new();
    fx.insert(&ctx.db_pool).await.unwrap();
    let store = PostgresClaimStore::new(ctx.db_pool.clone());
    let since = Utc::now() - Duration::days(7);

    let mut old = fx.claim(ClaimStatus::Generated, None);
    old.trigger_timestamp = Utc::now() - Duration::days(8);
    insert_claim(&ctx.db_pool, &old).await.unwrap();
    insert_claim(&ctx.db_pool, &fx.claim(ClaimStatus::Rejected, None))
        .await
        .unwrap();
    assert!(store
        .find_open_claim(fx.policy.id, fx.trigger.id, since)
        .await
        .unwrap()
        .is_none());

    let open = fx.claim(ClaimStatus::PendingPartnerReview, None);
    insert_claim(&ctx.db_pool, &open).await.unwrap();
    let found = store
        .find_open_claim(fx.policy.id, fx.trigger.id, since)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, open.id);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_sweeps_create_one_payout(ctx: &TestHarness) {
    let fx = DroughtPolicy::new();
    fx.insert(&ctx.db_pool).await.unwrap();
    let expired = fx.claim(ClaimStatus::Generated, Some(Utc::now() - Duration::hours(1)));
    insert_claim(&ctx.db_pool, &expired).await.unwrap();

    let deps = deps_with_series(ctx, &fx, &[]);
    let (a, b) = (deps.claim_lifecycle(), deps.claim_lifecycle());
    let now = Utc::now();
    let (ra, rb) = tokio::join!(a.auto_approve_expired(now), b.auto_approve_expired(now));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let approvals = ra
        .approved
        .iter()
        .chain(rb.approved.iter())
        .filter(|id| **id == expired.id)
        .count();
    assert_eq!(approvals, 1);

    let payouts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payouts WHERE claim_id = $1")
        .bind(expired.id)
        .fetch_one(&ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(payouts, 1);

    let claim = deps.claims.find_claim(expired.id).await.unwrap().unwrap();
    assert_eq!(claim.status, ClaimStatus::Approved);
    assert!(claim.auto_approved);

    let payout = deps.claims.find_payout(expired.id).await.unwrap().unwrap();
    assert_eq!(payout.status, PayoutStatus::Pending);
    assert_eq!(payout.payout_amount, expired.claim_amount);
    assert_eq!(payout.currency, "VND");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn paying_completes_payout(ctx: &TestHarness) {
    let fx = DroughtPolicy::new();
    fx.insert(&ctx.db_pool).await.unwrap();
    let claim = fx.claim(ClaimStatus::Generated, Some(Utc::now() + Duration::hours(72)));
    insert_claim(&ctx.db_pool, &claim).await.unwrap();
    let lifecycle = deps_with_series(ctx, &fx, &[]).claim_lifecycle();
    let store = PostgresClaimStore::new(ctx.db_pool.clone());

    lifecycle
        .record_partner_decision(claim.id, "approved", "partner-1", None, Utc::now())
        .await
        .unwrap();
    lifecycle.mark_paid(claim.id, Utc::now()).await.unwrap();

    let stored = store.find_claim(claim.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ClaimStatus::Paid);
    let payout = store.find_payout(claim.id).await.unwrap().unwrap();
    assert_eq!(payout.status, PayoutStatus::Completed);
    assert!(payout.completed_at.is_some());
}

// =============================================================================
// Measurements
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn duplicate_measurements_are_skipped(ctx: &TestHarness) {
    let fx = DroughtPolicy::new();
    fx.insert(&ctx.db_pool).await.unwrap();
    let store = PostgresMonitoringStore::new(ctx.db_pool.clone());
    let at = Utc::now();

    let point = SeriesPoint {
        dt: at.timestamp(),
        data: 4.2,
        count: 1,
        unit: None,
    };
    let row = |p: &SeriesPoint| {
        FarmMonitoringData::from_point(fx.policy.farm_id, fx.source.id, "rainfall", p, "weather")
            .unwrap()
    };

    assert_eq!(store.insert_measurements(&[row(&point)]).await.unwrap(), 1);
    assert_eq!(store.insert_measurements(&[row(&point)]).await.unwrap(), 0);

    let rows = store
        .measurements(
            fx.policy.farm_id,
            &[fx.source.id],
            at - Duration::hours(1),
            at + Duration::hours(1),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].measured_value, 4.2);
}

// =============================================================================
// Worker state
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn worker_rows_are_unique_per_policy(ctx: &TestHarness) {
    let fx = DroughtPolicy::new();
    let persistor = PostgresWorkerPersistor::new(ctx.db_pool.clone());
    let target = MonitorTarget::builder()
        .policy_id(fx.policy.id)
        .base_policy_id(fx.base.id)
        .farm_id(fx.policy.farm_id)
        .cadence(MonitorCadence::new(1, FrequencyUnit::Day))
        .build();
    let pool = WorkerPoolState::new(&target, 5, std::time::Duration::from_secs(1800));
    let scheduler = WorkerSchedulerState::new(&target);

    persistor
        .create_infrastructure(&pool, &scheduler)
        .await
        .unwrap();
    let err = persistor
        .create_infrastructure(&pool, &scheduler)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::PoolAlreadyExists(id) if id == fx.policy.id));

    persistor
        .set_pool_status(fx.policy.id, LifecycleStatus::Active, Utc::now())
        .await
        .unwrap();
    let stored = persistor.get_pool_state(fx.policy.id).await.unwrap().unwrap();
    assert_eq!(stored.pool_status, LifecycleStatus::Active);
    assert_eq!(stored.job_timeout(), std::time::Duration::from_secs(1800));
    assert!(stored.started_at.is_some());

    let stored = persistor
        .get_scheduler_state(fx.policy.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.monitor_interval(), std::time::Duration::from_secs(86_400));
}
