//! Test fixtures for creating test data.
//!
//! [`DroughtPolicy`] is the standard scenario: one active policy on a product
//! with a single rainfall trigger (7-day sum below 10mm). It can be seeded
//! into the in-memory doubles or inserted into Postgres.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use policy_monitor_core::common::{
    BasePolicyId, ClaimId, ConditionId, DataSourceId, EvaluationLogId, FarmId, FrequencyUnit,
    PolicyId, TriggerId,
};
use policy_monitor_core::domains::claims::models::claim_number;
use policy_monitor_core::domains::claims::{Claim, ClaimStatus, TriggerEvaluationLog};
use policy_monitor_core::domains::policies::{
    BasePolicy, DataSource, DataSourceKind, PolicyStatus, RegisteredPolicy, UnderwritingStatus,
};
use policy_monitor_core::domains::triggers::{
    AggregationFunction, LogicalOperator, ThresholdOperator, Trigger, TriggerCondition,
};
use policy_monitor_core::kernel::jobs::{JobContext, JobType, MonitoringFetchParams};
use policy_monitor_core::kernel::TestDependencies;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

pub const RAINFALL_THRESHOLD_MM: f64 = 10.0;

// =============================================================================
// Model builders
// =============================================================================

pub fn base_policy() -> BasePolicy {
    let now = Utc::now();
    BasePolicy {
        id: BasePolicyId::new(),
        insurance_provider_id: "provider-test".to_string(),
        product_name: "Rice drought cover".to_string(),
        crop_type: "rice".to_string(),
        coverage_currency: "VND".to_string(),
        fix_payout_amount: Decimal::new(1_000_000, 0),
        is_payout_per_hectare: false,
        over_threshold_multiplier: Decimal::ZERO,
        payout_base_rate: Decimal::ZERO,
        payout_cap: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn registered_policy(base: &BasePolicy, status: PolicyStatus) -> RegisteredPolicy {
    let now = Utc::now();
    let id = PolicyId::new();
    RegisteredPolicy {
        id,
        policy_number: format!("POL-{}", id),
        base_policy_id: base.id,
        insurance_provider_id: base.insurance_provider_id.clone(),
        farm_id: FarmId::new(),
        farmer_id: "farmer-test".to_string(),
        coverage_amount: Decimal::new(5_000_000, 0),
        coverage_start_date: now - Duration::days(60),
        coverage_end_date: now + Duration::days(120),
        area_multiplier: 1.0,
        status,
        underwriting_status: UnderwritingStatus::Approved,
        created_at: now,
        updated_at: now,
    }
}

pub fn rainfall_source() -> DataSource {
    DataSource {
        id: DataSourceId::new(),
        kind: DataSourceKind::Weather,
        parameter_name: "rainfall".to_string(),
        unit: Some("mm".to_string()),
        api_endpoint: None,
        created_at: Utc::now(),
    }
}

pub fn daily_trigger(base: &BasePolicy) -> Trigger {
    let now = Utc::now();
    Trigger {
        id: TriggerId::new(),
        base_policy_id: base.id,
        logical_operator: LogicalOperator::And,
        payout_percentage: None,
        growth_stage: None,
        valid_from_day: None,
        valid_to_day: None,
        monitor_interval: 1,
        monitor_frequency_unit: FrequencyUnit::Day,
        blackout_periods: None,
        created_at: now,
        updated_at: now,
    }
}

/// 7-day rainfall sum below the threshold.
pub fn low_rainfall_condition(trigger: &Trigger, source: &DataSource) -> TriggerCondition {
    TriggerCondition {
        id: ConditionId::new(),
        base_policy_trigger_id: trigger.id,
        data_source_id: source.id,
        threshold_operator: ThresholdOperator::LessThan,
        threshold_value: RAINFALL_THRESHOLD_MM,
        aggregation_function: AggregationFunction::Sum,
        aggregation_window_days: 7,
        consecutive_required: false,
        baseline_window_days: None,
        baseline_function: None,
        validation_window_days: 0,
        condition_order: 0,
        created_at: Utc::now(),
    }
}

/// A generated claim against the scenario's trigger.
pub fn claim(
    policy: &RegisteredPolicy,
    trigger: &Trigger,
    status: ClaimStatus,
    auto_approval_deadline: Option<DateTime<Utc>>,
) -> Claim {
    let now = Utc::now();
    let id = ClaimId::new();
    Claim {
        id,
        claim_number: claim_number(id, now),
        registered_policy_id: policy.id,
        base_policy_id: policy.base_policy_id,
        farm_id: policy.farm_id,
        base_policy_trigger_id: trigger.id,
        trigger_timestamp: now,
        over_threshold_value: Some(3.0),
        calculated_fix_payout: Decimal::new(1_000_000, 0),
        calculated_threshold_payout: Decimal::ZERO,
        claim_amount: Decimal::new(1_000_000, 0),
        status,
        auto_generated: true,
        partner_review_timestamp: None,
        partner_decision: None,
        partner_notes: None,
        reviewed_by: None,
        auto_approval_deadline,
        auto_approved: false,
        evidence_summary: None,
        created_at: now,
        updated_at: now,
    }
}

/// A passing evaluation log with no claim linked yet.
pub fn fired_evaluation_log(policy: &RegisteredPolicy, trigger: &Trigger) -> TriggerEvaluationLog {
    let now = Utc::now();
    TriggerEvaluationLog {
        id: EvaluationLogId::new(),
        registered_policy_id: policy.id,
        base_policy_id: policy.base_policy_id,
        farm_id: policy.farm_id,
        base_policy_trigger_id: trigger.id,
        evaluation_timestamp: now,
        evaluation_result: true,
        conditions_evaluated: 1,
        conditions_met: 1,
        condition_details: serde_json::json!({ "conditions": [] }),
        skip_reason: None,
        claim_generated: false,
        claim_id: None,
        evaluation_duration_ms: 1,
        data_sources_queried: 1,
        created_at: now,
    }
}

/// One reading per day, newest first, ending at `end`.
pub fn daily_readings(end: DateTime<Utc>, values: &[f64]) -> Vec<(DateTime<Utc>, f64)> {
    values
        .iter()
        .enumerate()
        .map(|(days_ago, value)| (end - Duration::days(days_ago as i64), *value))
        .collect()
}

pub fn job_context(job_type: JobType, policy_id: PolicyId) -> JobContext {
    JobContext {
        job_id: format!("test-{}", uuid::Uuid::new_v4()),
        job_type,
        policy_id: Some(policy_id),
        attempt: 1,
        cancel: CancellationToken::new(),
    }
}

// =============================================================================
// Drought scenario
// =============================================================================

pub struct DroughtPolicy {
    pub base: BasePolicy,
    pub policy: RegisteredPolicy,
    pub source: DataSource,
    pub trigger: Trigger,
    pub condition: TriggerCondition,
}

impl DroughtPolicy {
    pub fn new() -> Self {
        Self::with_status(PolicyStatus::Active)
    }

    pub fn with_status(status: PolicyStatus) -> Self {
        let base = base_policy();
        let policy = registered_policy(&base, status);
        let source = rainfall_source();
        let trigger = daily_trigger(&base);
        let condition = low_rainfall_condition(&trigger, &source);
        Self {
            base,
            policy,
            source,
            trigger,
            condition,
        }
    }

    pub fn fetch_params(&self) -> serde_json::Value {
        serde_json::to_value(MonitoringFetchParams {
            policy_id: self.policy.id,
            farm_id: self.policy.farm_id,
            base_policy_id: self.base.id,
            parameters: vec![],
            lookback_days: 7,
            scheduled_at: Utc::now(),
        })
        .expect("fetch params serialize")
    }

    pub fn seed(&self, deps: &TestDependencies) {
        deps.catalog.add_base_policy(self.base.clone());
        deps.catalog.add_policy(self.policy.clone());
        deps.catalog.add_data_source(self.source.clone());
        deps.catalog.add_trigger(self.trigger.clone());
        deps.catalog.add_condition(self.condition.clone());
    }

    /// Insert the whole catalog for this scenario.
    pub async fn insert(&self, pool: &PgPool) -> Result<()> {
        let base = &self.base;
        sqlx::query(
            r#"
            INSERT INTO base_policies (
                id, insurance_provider_id, product_name, crop_type, coverage_currency,
                fix_payout_amount, is_payout_per_hectare, over_threshold_multiplier,
                payout_base_rate, payout_cap
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(base.id)
        .bind(&base.insurance_provider_id)
        .bind(&base.product_name)
        .bind(&base.crop_type)
        .bind(&base.coverage_currency)
        .bind(base.fix_payout_amount)
        .bind(base.is_payout_per_hectare)
        .bind(base.over_threshold_multiplier)
        .bind(base.payout_base_rate)
        .bind(base.payout_cap)
        .execute(pool)
        .await?;

        let policy = &self.policy;
        sqlx::query(
            r#"
            INSERT INTO registered_policies (
                id, policy_number, base_policy_id, insurance_provider_id, farm_id, farmer_id,
                coverage_amount, coverage_start_date, coverage_end_date, area_multiplier,
                status, underwriting_status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(policy.id)
        .bind(&policy.policy_number)
        .bind(policy.base_policy_id)
        .bind(&policy.insurance_provider_id)
        .bind(policy.farm_id)
        .bind(&policy.farmer_id)
        .bind(policy.coverage_amount)
        .bind(policy.coverage_start_date)
        .bind(policy.coverage_end_date)
        .bind(policy.area_multiplier)
        .bind(policy.status)
        .bind(policy.underwriting_status)
        .execute(pool)
        .await?;

        let source = &self.source;
        sqlx::query(
            r#"
            INSERT INTO data_sources (id, data_source, parameter_name, unit, api_endpoint)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(source.id)
        .bind(source.kind)
        .bind(&source.parameter_name)
        .bind(&source.unit)
        .bind(&source.api_endpoint)
        .execute(pool)
        .await?;

        let trigger = &self.trigger;
        sqlx::query(
            r#"
            INSERT INTO base_policy_triggers (
                id, base_policy_id, logical_operator, payout_percentage, growth_stage,
                valid_from_day, valid_to_day, monitor_interval, monitor_frequency_unit,
                blackout_periods
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(trigger.id)
        .bind(trigger.base_policy_id)
        .bind(trigger.logical_operator)
        .bind(trigger.payout_percentage)
        .bind(&trigger.growth_stage)
        .bind(trigger.valid_from_day)
        .bind(trigger.valid_to_day)
        .bind(trigger.monitor_interval)
        .bind(trigger.monitor_frequency_unit)
        .bind(&trigger.blackout_periods)
        .execute(pool)
        .await?;

        let condition = &self.condition;
        sqlx::query(
            r#"
            INSERT INTO base_policy_trigger_conditions (
                id, base_policy_trigger_id, data_source_id, threshold_operator,
                threshold_value, aggregation_function, aggregation_window_days,
                consecutive_required, baseline_window_days, baseline_function,
                validation_window_days, condition_order
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(condition.id)
        .bind(condition.base_policy_trigger_id)
        .bind(condition.data_source_id)
        .bind(condition.threshold_operator)
        .bind(condition.threshold_value)
        .bind(condition.aggregation_function)
        .bind(condition.aggregation_window_days)
        .bind(condition.consecutive_required)
        .bind(condition.baseline_window_days)
        .bind(condition.baseline_function)
        .bind(condition.validation_window_days)
        .bind(condition.condition_order)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub fn claim(&self, status: ClaimStatus, deadline: Option<DateTime<Utc>>) -> Claim {
        claim(&self.policy, &self.trigger, status, deadline)
    }

    pub fn fired_log(&self) -> TriggerEvaluationLog {
        fired_evaluation_log(&self.policy, &self.trigger)
    }
}

impl Default for DroughtPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert a claim row directly, without an evaluation log.
pub async fn insert_claim(pool: &PgPool, claim: &Claim) -> Result<()> {
    let mut conn = pool.acquire().await?;
    claim.insert(&mut *conn).await
}
