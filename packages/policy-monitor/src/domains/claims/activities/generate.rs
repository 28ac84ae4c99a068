//! Claim generation.
//!
//! Turns a finished [`TriggerEvaluation`] into its audit log row, its
//! updated streaks and, when the trigger fired and no open claim overlaps,
//! a new claim. All of it is written in one transaction.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::common::ClaimId;
use crate::domains::claims::models::{claim_number, Claim, ClaimStatus, TriggerEvaluationLog};
use crate::domains::claims::payout_formula::calculate_payout;
use crate::domains::claims::store::{ClaimStore, EvaluationRecord};
use crate::domains::claims::ClaimConfig;
use crate::domains::policies::{BasePolicy, RegisteredPolicy};
use crate::domains::triggers::{Trigger, TriggerEvaluation};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimDecision {
    NotTriggered,
    Generated { claim_id: ClaimId },
    Suppressed { open_claim_id: ClaimId },
}

/// Log one evaluation pass and raise a claim if it fired.
#[allow(clippy::too_many_arguments)]
pub async fn record_evaluation(
    store: &dyn ClaimStore,
    policy: &RegisteredPolicy,
    base_policy: &BasePolicy,
    trigger: &Trigger,
    evaluation: &TriggerEvaluation,
    duration_ms: i64,
    config: &ClaimConfig,
    now: DateTime<Utc>,
) -> Result<ClaimDecision> {
    let log = TriggerEvaluationLog::from_evaluation(
        evaluation,
        policy.base_policy_id,
        policy.farm_id,
        duration_ms,
    );

    if !evaluation.result {
        store
            .record_evaluation(&EvaluationRecord {
                log,
                streaks: evaluation.streaks.clone(),
                candidate: None,
            })
            .await?;
        return Ok(ClaimDecision::NotTriggered);
    }

    let claim = build_claim(policy, base_policy, trigger, evaluation, config, now);
    let since = now - evaluation.evaluation_window();
    let record = EvaluationRecord {
        log,
        streaks: evaluation.streaks.clone(),
        candidate: Some((claim.clone(), since)),
    };

    if let Some(open) = store.record_evaluation(&record).await? {
        warn!(
            policy_id = %policy.id,
            trigger_id = %trigger.id,
            open_claim_id = %open.id,
            "trigger fired but an open claim covers this window, suppressing"
        );
        return Ok(ClaimDecision::Suppressed {
            open_claim_id: open.id,
        });
    }

    info!(
        policy_id = %policy.id,
        trigger_id = %trigger.id,
        claim_id = %claim.id,
        claim_number = %claim.claim_number,
        claim_amount = %claim.claim_amount,
        "claim generated"
    );
    Ok(ClaimDecision::Generated { claim_id: claim.id })
}

fn build_claim(
    policy: &RegisteredPolicy,
    base_policy: &BasePolicy,
    trigger: &Trigger,
    evaluation: &TriggerEvaluation,
    config: &ClaimConfig,
    now: DateTime<Utc>,
) -> Claim {
    let over_threshold = evaluation.over_threshold_value().unwrap_or(0.0);
    let payout = calculate_payout(policy, base_policy, trigger, over_threshold);
    let id = ClaimId::new();

    Claim {
        id,
        claim_number: claim_number(id, now),
        registered_policy_id: policy.id,
        base_policy_id: policy.base_policy_id,
        farm_id: policy.farm_id,
        base_policy_trigger_id: trigger.id,
        trigger_timestamp: evaluation.evaluated_at,
        over_threshold_value: Some(over_threshold),
        calculated_fix_payout: payout.calculated_fix_payout,
        calculated_threshold_payout: payout.calculated_threshold_payout,
        claim_amount: payout.claim_amount,
        status: ClaimStatus::Generated,
        auto_generated: true,
        partner_review_timestamp: None,
        partner_decision: None,
        partner_notes: None,
        reviewed_by: None,
        auto_approval_deadline: Some(now + config.auto_approval_grace),
        auto_approved: false,
        evidence_summary: Some(serde_json::json!({
            "trigger_id": trigger.id,
            "logical_operator": trigger.logical_operator,
            "evaluated_at": evaluation.evaluated_at,
            "conditions": evaluation.condition_details(),
            "payout": payout,
        })),
        created_at: now,
        updated_at: now,
    }
}
