//! The `fetch-farm-monitoring-data` handler end to end over the in-memory
//! doubles: provider series in, measurements, evaluation logs, and claims out.

mod common;

use chrono::{Duration, Utc};
use policy_monitor_core::domains::claims::ClaimStatus;
use policy_monitor_core::domains::policies::PolicyStatus;
use policy_monitor_core::kernel::jobs::{JobError, JobHandler, JobType};
use policy_monitor_core::kernel::{ProviderError, TestDependencies};
use rust_decimal::Decimal;

use crate::common::{daily_readings, job_context, DroughtPolicy};

fn seeded(fx: &DroughtPolicy, values: &[f64]) -> TestDependencies {
    let deps = TestDependencies::new();
    fx.seed(&deps);
    deps.provider
        .set_series(fx.source.id, &daily_readings(Utc::now(), values));
    deps
}

async fn run(
    deps: &TestDependencies,
    fx: &DroughtPolicy,
) -> Result<serde_json::Value, JobError> {
    deps.deps()
        .fetch_handler()
        .execute(
            &job_context(JobType::FetchFarmMonitoringData, fx.policy.id),
            &fx.fetch_params(),
        )
        .await
}

// =============================================================================
// Claim generation
// =============================================================================

#[tokio::test]
async fn dry_week_generates_claim() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[1.0; 7]);

    let summary = run(&deps, &fx).await.unwrap();

    assert_eq!(summary["measurements_fetched"], 7);
    assert_eq!(summary["measurements_inserted"], 7);
    assert_eq!(summary["claims_generated"].as_array().unwrap().len(), 1);
    assert_eq!(summary["triggers"][0]["result"], true);
    assert_eq!(deps.monitoring.rows().len(), 7);

    let claims = deps.claims.claims();
    assert_eq!(claims.len(), 1);
    let claim = &claims[0];
    assert_eq!(claim.status, ClaimStatus::Generated);
    assert!(claim.auto_generated);
    assert_eq!(claim.registered_policy_id, fx.policy.id);
    assert_eq!(claim.base_policy_trigger_id, fx.trigger.id);
    assert_eq!(claim.claim_amount, Decimal::new(1_000_000, 0));
    assert!(claim.claim_number.starts_with("CLM-"));
    let deadline = claim.auto_approval_deadline.unwrap();
    assert!(deadline > Utc::now() + Duration::hours(71));

    let logs = deps.claims.logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].evaluation_result);
    assert!(logs[0].claim_generated);
    assert_eq!(logs[0].claim_id, Some(claim.id));
    assert_eq!(logs[0].conditions_evaluated, 1);
    assert_eq!(logs[0].conditions_met, 1);
}

#[tokio::test]
async fn second_run_in_window_is_suppressed() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[1.0; 7]);

    run(&deps, &fx).await.unwrap();
    let summary = run(&deps, &fx).await.unwrap();

    assert_eq!(summary["measurements_inserted"], 0);
    assert!(summary["claims_generated"].as_array().unwrap().is_empty());
    assert_eq!(summary["triggers"][0]["decision"]["outcome"], "suppressed");

    let claims = deps.claims.claims();
    assert_eq!(claims.len(), 1);

    let logs = deps.claims.logs();
    assert_eq!(logs.len(), 2);
    let suppressed = logs.iter().find(|l| !l.claim_generated).unwrap();
    assert!(suppressed.evaluation_result);
    assert_eq!(suppressed.suppressed_by(), Some(claims[0].id));
}

#[tokio::test]
async fn rejected_claim_does_not_suppress() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[1.0; 7]);
    deps.claims
        .insert_claim(fx.claim(ClaimStatus::Rejected, None));

    run(&deps, &fx).await.unwrap();

    let generated: Vec<_> = deps
        .claims
        .claims()
        .into_iter()
        .filter(|c| c.status == ClaimStatus::Generated)
        .collect();
    assert_eq!(generated.len(), 1);
}

#[tokio::test]
async fn wet_week_logs_without_claim() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[5.0; 7]);

    let summary = run(&deps, &fx).await.unwrap();

    assert_eq!(summary["triggers"][0]["result"], false);
    assert!(deps.claims.claims().is_empty());
    let logs = deps.claims.logs();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].evaluation_result);
    assert!(!logs[0].claim_generated);
    assert_eq!(logs[0].conditions_met, 0);
}

#[tokio::test]
async fn empty_series_aggregates_to_zero_and_fires() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[]);

    let summary = run(&deps, &fx).await.unwrap();

    assert_eq!(summary["measurements_fetched"], 0);
    assert_eq!(deps.claims.claims().len(), 1);
}

#[tokio::test]
async fn rerunning_one_tick_counts_a_single_cycle() {
    let mut fx = DroughtPolicy::new();
    fx.condition.consecutive_required = true;
    fx.condition.aggregation_window_days = 1;
    fx.condition.validation_window_days = 7;
    let deps = seeded(&fx, &[1.0; 7]);

    // Retries and redeliveries of the same tick
    for _ in 0..7 {
        let summary = run(&deps, &fx).await.unwrap();
        assert_eq!(summary["triggers"][0]["result"], false);
    }

    let streak = deps
        .claims
        .streak(fx.policy.id, fx.condition.id)
        .unwrap();
    assert_eq!(streak.streak_count, 1);
    assert!(deps.claims.claims().is_empty());
    assert_eq!(deps.claims.logs().len(), 7);
}

// =============================================================================
// Skips and failures
// =============================================================================

#[tokio::test]
async fn inactive_policy_is_skipped() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[1.0; 7]);
    deps.catalog.set_status(fx.policy.id, PolicyStatus::Cancelled);

    let summary = run(&deps, &fx).await.unwrap();

    assert_eq!(summary["skipped"], "policy_inactive");
    assert!(deps.provider.calls().is_empty());
    assert!(deps.claims.logs().is_empty());
}

#[tokio::test]
async fn expired_coverage_is_skipped() {
    let mut fx = DroughtPolicy::new();
    fx.policy.coverage_end_date = Utc::now() - Duration::days(1);
    let deps = seeded(&fx, &[1.0; 7]);

    let summary = run(&deps, &fx).await.unwrap();

    assert_eq!(summary["skipped"], "outside_coverage");
    assert!(deps.claims.claims().is_empty());
}

#[tokio::test]
async fn unknown_policy_fails_permanently() {
    let fx = DroughtPolicy::new();
    let deps = TestDependencies::new();

    let err = run(&deps, &fx).await.unwrap_err();
    assert!(matches!(err, JobError::Permanent(_)));
}

#[tokio::test]
async fn malformed_params_fail_permanently() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[1.0; 7]);

    let err = deps
        .deps()
        .fetch_handler()
        .execute(
            &job_context(JobType::FetchFarmMonitoringData, fx.policy.id),
            &serde_json::json!({ "policy_id": "not-a-uuid" }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Permanent(_)));
}

#[tokio::test]
async fn provider_outage_is_transient_and_writes_nothing() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[1.0; 7]);
    deps.provider
        .fail_next(ProviderError::Transient("503 Service Unavailable".into()));

    let err = run(&deps, &fx).await.unwrap_err();

    assert!(err.should_retry());
    assert!(deps.monitoring.rows().is_empty());
    assert!(deps.claims.logs().is_empty());

    // The retry goes through
    run(&deps, &fx).await.unwrap();
    assert_eq!(deps.claims.claims().len(), 1);
}

#[tokio::test]
async fn provider_rejection_is_permanent() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[1.0; 7]);
    deps.provider
        .fail_next(ProviderError::Permanent("400 Bad Request".into()));

    let err = run(&deps, &fx).await.unwrap_err();
    assert!(matches!(err, JobError::Permanent(_)));
}

#[tokio::test]
async fn cancelled_job_stops_before_fetching() {
    let fx = DroughtPolicy::new();
    let deps = seeded(&fx, &[1.0; 7]);
    let ctx = job_context(JobType::FetchFarmMonitoringData, fx.policy.id);
    ctx.cancel.cancel();

    let err = deps
        .deps()
        .fetch_handler()
        .execute(&ctx, &fx.fetch_params())
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Cancelled));
    assert!(deps.provider.calls().is_empty());
}
