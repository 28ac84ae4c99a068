use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

use crate::closed_enum;
use crate::common::{BasePolicyId, ClaimId, FarmId, PolicyId, TriggerId};

closed_enum! {
    /// generated -> pending_partner_review -> approved | rejected;
    /// approved -> paid.
    pub enum ClaimStatus as "claim status" {
        Generated => "generated",
        PendingPartnerReview => "pending_partner_review",
        Approved => "approved",
        Rejected => "rejected",
        Paid => "paid",
    }
}

impl ClaimStatus {
    /// Statuses that block a new claim for the same trigger.
    pub const OPEN: &'static [ClaimStatus] = &[
        ClaimStatus::Generated,
        ClaimStatus::PendingPartnerReview,
        ClaimStatus::Approved,
    ];

    /// Statuses a partner (or the sweep) may still decide.
    pub const UNDECIDED: &'static [ClaimStatus] =
        &[ClaimStatus::Generated, ClaimStatus::PendingPartnerReview];

    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }

    pub fn is_undecided(&self) -> bool {
        Self::UNDECIDED.contains(self)
    }

    pub fn can_transition_to(&self, next: ClaimStatus) -> bool {
        use ClaimStatus::*;
        matches!(
            (self, next),
            (Generated, PendingPartnerReview)
                | (Generated, Approved)
                | (Generated, Rejected)
                | (PendingPartnerReview, Approved)
                | (PendingPartnerReview, Rejected)
                | (Approved, Paid)
        )
    }
}

closed_enum! {
    pub enum PartnerDecision as "partner decision" {
        Approved => "approved",
        Rejected => "rejected",
    }
}

impl PartnerDecision {
    pub fn status(&self) -> ClaimStatus {
        match self {
            PartnerDecision::Approved => ClaimStatus::Approved,
            PartnerDecision::Rejected => ClaimStatus::Rejected,
        }
    }
}

/// A payout claim raised by a positive trigger evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Claim {
    pub id: ClaimId,
    pub claim_number: String,
    pub registered_policy_id: PolicyId,
    pub base_policy_id: BasePolicyId,
    pub farm_id: FarmId,
    pub base_policy_trigger_id: TriggerId,
    pub trigger_timestamp: DateTime<Utc>,
    pub over_threshold_value: Option<f64>,
    pub calculated_fix_payout: Decimal,
    pub calculated_threshold_payout: Decimal,
    pub claim_amount: Decimal,
    pub status: ClaimStatus,
    pub auto_generated: bool,
    pub partner_review_timestamp: Option<DateTime<Utc>>,
    pub partner_decision: Option<PartnerDecision>,
    pub partner_notes: Option<String>,
    pub reviewed_by: Option<String>,
    pub auto_approval_deadline: Option<DateTime<Utc>>,
    pub auto_approved: bool,
    pub evidence_summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `CLM-<yyyymmdd>-<last 12 hex of the id>`. The tail of a v7 id is random.
pub fn claim_number(id: ClaimId, at: DateTime<Utc>) -> String {
    let hex = id.into_uuid().simple().to_string();
    format!(
        "CLM-{}-{}",
        at.format("%Y%m%d"),
        hex[hex.len() - 12..].to_uppercase()
    )
}

impl Claim {
    pub fn is_auto_approvable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_undecided() && self.auto_approval_deadline.is_some_and(|d| d <= now)
    }

    pub async fn find_by_id(id: ClaimId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM claims WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// Newest open claim for the trigger raised after `since`.
    pub async fn find_open_since(
        policy_id: PolicyId,
        trigger_id: TriggerId,
        since: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM claims
            WHERE registered_policy_id = $1
              AND base_policy_trigger_id = $2
              AND status = ANY($3)
              AND trigger_timestamp > $4
            ORDER BY trigger_timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(policy_id)
        .bind(trigger_id)
        .bind(ClaimStatus::OPEN)
        .bind(since)
        .fetch_optional(conn)
        .await
        .map_err(Into::into)
    }

    /// Undecided claims whose auto-approval deadline has passed.
    pub async fn find_auto_approvable(now: DateTime<Utc>, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM claims
            WHERE status = ANY($1)
              AND auto_approval_deadline IS NOT NULL
              AND auto_approval_deadline <= $2
            ORDER BY auto_approval_deadline ASC
            "#,
        )
        .bind(ClaimStatus::UNDECIDED)
        .bind(now)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn insert(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO claims (
                id, claim_number, registered_policy_id, base_policy_id, farm_id,
                base_policy_trigger_id, trigger_timestamp, over_threshold_value,
                calculated_fix_payout, calculated_threshold_payout, claim_amount, status,
                auto_generated, partner_review_timestamp, partner_decision, partner_notes,
                reviewed_by, auto_approval_deadline, auto_approved, evidence_summary,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(self.id)
        .bind(&self.claim_number)
        .bind(self.registered_policy_id)
        .bind(self.base_policy_id)
        .bind(self.farm_id)
        .bind(self.base_policy_trigger_id)
        .bind(self.trigger_timestamp)
        .bind(self.over_threshold_value)
        .bind(self.calculated_fix_payout)
        .bind(self.calculated_threshold_payout)
        .bind(self.claim_amount)
        .bind(self.status)
        .bind(self.auto_generated)
        .bind(self.partner_review_timestamp)
        .bind(self.partner_decision)
        .bind(&self.partner_notes)
        .bind(&self.reviewed_by)
        .bind(self.auto_approval_deadline)
        .bind(self.auto_approved)
        .bind(&self.evidence_summary)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Write status and review fields, but only if the row is still in
    /// `expected`. Returns false when another writer got there first.
    pub async fn update_if_status(
        &self,
        expected: ClaimStatus,
        conn: &mut PgConnection,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE claims SET
                status = $3,
                partner_review_timestamp = $4,
                partner_decision = $5,
                partner_notes = $6,
                reviewed_by = $7,
                auto_approved = $8,
                updated_at = $9
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(self.id)
        .bind(expected)
        .bind(self.status)
        .bind(self.partner_review_timestamp)
        .bind(self.partner_decision)
        .bind(&self.partner_notes)
        .bind(&self.reviewed_by)
        .bind(self.auto_approved)
        .bind(self.updated_at)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
