use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

use crate::common::{BasePolicyId, ClaimId, EvaluationLogId, FarmId, PolicyId, TriggerId};
use crate::domains::triggers::{SkipReason, TriggerEvaluation};

/// Audit row written for every evaluation pass. Never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TriggerEvaluationLog {
    pub id: EvaluationLogId,
    pub registered_policy_id: PolicyId,
    pub base_policy_id: BasePolicyId,
    pub farm_id: FarmId,
    pub base_policy_trigger_id: TriggerId,
    pub evaluation_timestamp: DateTime<Utc>,
    pub evaluation_result: bool,
    pub conditions_evaluated: i32,
    pub conditions_met: i32,
    pub condition_details: serde_json::Value,
    pub skip_reason: Option<SkipReason>,
    pub claim_generated: bool,
    pub claim_id: Option<ClaimId>,
    pub evaluation_duration_ms: i64,
    pub data_sources_queried: i32,
    pub created_at: DateTime<Utc>,
}

impl TriggerEvaluationLog {
    pub fn from_evaluation(
        evaluation: &TriggerEvaluation,
        base_policy_id: BasePolicyId,
        farm_id: FarmId,
        duration_ms: i64,
    ) -> Self {
        Self {
            id: EvaluationLogId::new(),
            registered_policy_id: evaluation.policy_id,
            base_policy_id,
            farm_id,
            base_policy_trigger_id: evaluation.trigger_id,
            evaluation_timestamp: evaluation.evaluated_at,
            evaluation_result: evaluation.result,
            conditions_evaluated: evaluation.conditions_evaluated(),
            conditions_met: evaluation.conditions_met(),
            condition_details: serde_json::json!({
                "conditions": evaluation.condition_details(),
                "evaluation_window_days": evaluation.evaluation_window_days,
            }),
            skip_reason: evaluation.skip_reason,
            claim_generated: false,
            claim_id: None,
            evaluation_duration_ms: duration_ms.max(0),
            data_sources_queried: evaluation.data_sources_queried(),
            created_at: Utc::now(),
        }
    }

    pub fn link_claim(&mut self, claim_id: ClaimId) {
        self.claim_generated = true;
        self.claim_id = Some(claim_id);
    }

    pub fn mark_suppressed(&mut self, by: ClaimId) {
        if let Some(details) = self.condition_details.as_object_mut() {
            details.insert("suppressed_by_claim_id".into(), serde_json::json!(by));
        }
    }

    pub fn suppressed_by(&self) -> Option<ClaimId> {
        self.condition_details
            .get("suppressed_by_claim_id")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub async fn insert(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trigger_evaluation_logs (
                id, registered_policy_id, base_policy_id, farm_id, base_policy_trigger_id,
                evaluation_timestamp, evaluation_result, conditions_evaluated, conditions_met,
                condition_details, skip_reason, claim_generated, claim_id,
                evaluation_duration_ms, data_sources_queried, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(self.id)
        .bind(self.registered_policy_id)
        .bind(self.base_policy_id)
        .bind(self.farm_id)
        .bind(self.base_policy_trigger_id)
        .bind(self.evaluation_timestamp)
        .bind(self.evaluation_result)
        .bind(self.conditions_evaluated)
        .bind(self.conditions_met)
        .bind(&self.condition_details)
        .bind(self.skip_reason)
        .bind(self.claim_generated)
        .bind(self.claim_id)
        .bind(self.evaluation_duration_ms)
        .bind(self.data_sources_queried)
        .bind(self.created_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn find_for_policy(
        policy_id: PolicyId,
        limit: i64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM trigger_evaluation_logs
            WHERE registered_policy_id = $1
            ORDER BY evaluation_timestamp DESC, created_at DESC
            LIMIT $2
            "#,
        )
        .bind(policy_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
