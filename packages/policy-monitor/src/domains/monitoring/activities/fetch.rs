//! `fetch-farm-monitoring-data` handler.
//!
//! One run per scheduler tick:
//!
//! 1. load the policy's monitoring plan
//! 2. pull each data source's series for the lookback window and store it
//! 3. evaluate every trigger against the stored measurements
//! 4. log each evaluation and raise claims for the ones that fired

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::common::{DataSourceId, TriggerId, UnknownVariant};
use crate::domains::claims::{self, ClaimConfig, ClaimDecision, ClaimStore};
use crate::domains::monitoring::models::FarmMonitoringData;
use crate::domains::monitoring::store::MonitoringStore;
use crate::domains::policies::{MonitoringPlan, PolicyCatalog, PolicyStatus};
use crate::domains::triggers::{
    evaluate_trigger, EvaluationError, EvaluationInput, EvaluatorConfig, Measurement, SkipReason,
};
use crate::kernel::jobs::{JobContext, JobError, JobHandler, MonitoringFetchParams};
use crate::kernel::{BaseDataProvider, ProviderError, SeriesRequest};

#[derive(Debug, Clone, Serialize)]
struct TriggerOutcome {
    trigger_id: TriggerId,
    result: bool,
    skip_reason: Option<SkipReason>,
    conditions_met: i32,
    conditions_evaluated: i32,
    decision: ClaimDecision,
}

#[derive(TypedBuilder)]
pub struct FetchFarmMonitoringDataHandler {
    catalog: Arc<dyn PolicyCatalog>,
    provider: Arc<dyn BaseDataProvider>,
    monitoring: Arc<dyn MonitoringStore>,
    claims: Arc<dyn ClaimStore>,
    #[builder(default)]
    evaluator: EvaluatorConfig,
    #[builder(default)]
    claim_config: ClaimConfig,
}

impl FetchFarmMonitoringDataHandler {
    async fn fetch(
        &self,
        ctx: &JobContext,
        plan: &MonitoringPlan,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(usize, u64), JobError> {
        let mut sources: Vec<_> = plan.data_sources.values().collect();
        sources.sort_by_key(|ds| ds.id);

        let mut fetched = 0;
        let mut inserted = 0;
        for ds in sources {
            if ctx.cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let request = SeriesRequest {
                farm_id: plan.policy.farm_id,
                data_source_id: ds.id,
                parameter_name: ds.parameter_name.clone(),
                endpoint: ds.api_endpoint.clone(),
                from,
                to,
            };
            let points = self
                .provider
                .fetch_series(&request)
                .await
                .map_err(|e| match e {
                    ProviderError::Transient(_) => JobError::transient(e),
                    ProviderError::Permanent(_) => JobError::permanent(e),
                })?;

            let rows: Vec<FarmMonitoringData> = points
                .iter()
                .filter_map(|point| {
                    FarmMonitoringData::from_point(
                        plan.policy.farm_id,
                        ds.id,
                        &ds.parameter_name,
                        point,
                        ds.kind.as_str(),
                    )
                })
                .collect();
            let new = self.monitoring.insert_measurements(&rows).await?;

            debug!(
                policy_id = %plan.policy.id,
                data_source_id = %ds.id,
                parameter = %ds.parameter_name,
                points = points.len(),
                inserted = new,
                "fetched monitoring series"
            );
            fetched += points.len();
            inserted += new;
        }
        Ok((fetched, inserted))
    }

    async fn evaluate(
        &self,
        plan: &MonitoringPlan,
        from: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TriggerOutcome>, JobError> {
        let mut ids: Vec<DataSourceId> = plan.data_sources.keys().copied().collect();
        ids.sort();

        let mut series: HashMap<DataSourceId, Vec<Measurement>> = HashMap::new();
        for row in self
            .monitoring
            .measurements(plan.policy.farm_id, &ids, from, now)
            .await?
        {
            series
                .entry(row.data_source_id)
                .or_default()
                .push(row.measurement());
        }

        let streaks: HashMap<_, _> = self
            .claims
            .streaks(plan.policy.id)
            .await?
            .into_iter()
            .map(|s| (s.condition_id, s))
            .collect();

        let mut outcomes = Vec::with_capacity(plan.triggers.len());
        for tp in &plan.triggers {
            let started = Instant::now();
            let evaluation = evaluate_trigger(
                &EvaluationInput {
                    policy_id: plan.policy.id,
                    trigger: &tp.trigger,
                    conditions: &tp.conditions,
                    series: &series,
                    streaks: &streaks,
                    coverage_start: plan.policy.coverage_start_date,
                    now,
                },
                &self.evaluator,
            )
            .map_err(JobError::permanent)?;
            let duration_ms = started.elapsed().as_millis() as i64;

            let decision = claims::record_evaluation(
                self.claims.as_ref(),
                &plan.policy,
                &plan.base_policy,
                &tp.trigger,
                &evaluation,
                duration_ms,
                &self.claim_config,
                now,
            )
            .await?;

            outcomes.push(TriggerOutcome {
                trigger_id: tp.trigger.id,
                result: evaluation.result,
                skip_reason: evaluation.skip_reason,
                conditions_met: evaluation.conditions_met(),
                conditions_evaluated: evaluation.conditions_evaluated(),
                decision,
            });
        }
        Ok(outcomes)
    }
}

/// Definition errors (undecodable enum columns, invalid conditions) never
/// heal on retry. Everything else is treated as infrastructure.
fn classify(err: anyhow::Error) -> JobError {
    let permanent = err.chain().any(|cause| {
        cause.is::<UnknownVariant>()
            || cause.is::<EvaluationError>()
            || matches!(
                cause.downcast_ref::<sqlx::Error>(),
                Some(sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_))
            )
    });
    if permanent {
        JobError::Permanent(err)
    } else {
        JobError::Transient(err)
    }
}

#[async_trait]
impl JobHandler for FetchFarmMonitoringDataHandler {
    async fn execute(
        &self,
        ctx: &JobContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, JobError> {
        let params: MonitoringFetchParams = serde_json::from_value(params.clone())
            .map_err(|e| {
                JobError::permanent(anyhow::Error::new(e).context("invalid fetch params"))
            })?;
        let policy_id = params.policy_id;

        match self.catalog.policy_status(policy_id).await.map_err(classify)? {
            None => {
                return Err(JobError::permanent(anyhow::anyhow!(
                    "registered policy {} not found",
                    policy_id
                )))
            }
            Some(status) if status != PolicyStatus::Active => {
                warn!(
                    policy_id = %policy_id,
                    status = %status,
                    "policy no longer active, skipping fetch"
                );
                return Ok(json!({ "policy_id": policy_id, "skipped": "policy_inactive" }));
            }
            Some(_) => {}
        }

        let plan = self
            .catalog
            .load_monitoring_plan(policy_id)
            .await
            .map_err(classify)?;

        let now = Utc::now();
        if !plan.policy.covers(now) {
            info!(policy_id = %policy_id, "outside coverage period, skipping fetch");
            return Ok(json!({ "policy_id": policy_id, "skipped": "outside_coverage" }));
        }

        let lookback = plan.lookback_days().max(params.lookback_days);
        let from = now - Duration::days(lookback as i64);

        let (fetched, inserted) = self.fetch(ctx, &plan, from, now).await?;
        if ctx.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let outcomes = self.evaluate(&plan, from, now).await?;

        let claims_generated: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o.decision {
                ClaimDecision::Generated { claim_id } => Some(claim_id),
                _ => None,
            })
            .collect();

        info!(
            policy_id = %policy_id,
            attempt = ctx.attempt,
            fetched,
            inserted,
            triggers = outcomes.len(),
            fired = outcomes.iter().filter(|o| o.result).count(),
            claims = claims_generated.len(),
            "monitoring fetch complete"
        );

        Ok(json!({
            "policy_id": policy_id,
            "lookback_days": lookback,
            "measurements_fetched": fetched,
            "measurements_inserted": inserted,
            "claims_generated": claims_generated,
            "triggers": outcomes,
        }))
    }
}
