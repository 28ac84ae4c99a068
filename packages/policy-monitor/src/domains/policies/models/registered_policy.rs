use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

use crate::closed_enum;
use crate::common::{BasePolicyId, FarmId, PolicyId};

closed_enum! {
    pub enum PolicyStatus as "policy status" {
        Draft => "draft",
        PendingReview => "pending_review",
        Active => "active",
        Expired => "expired",
        Cancelled => "cancelled",
        Rejected => "rejected",
    }
}

impl PolicyStatus {
    /// Terminal policies never monitor again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PolicyStatus::Expired | PolicyStatus::Cancelled | PolicyStatus::Rejected
        )
    }
}

closed_enum! {
    pub enum UnderwritingStatus as "underwriting status" {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

/// A farmer-bound insurance contract. Only `active` policies are monitored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegisteredPolicy {
    pub id: PolicyId,
    pub policy_number: String,
    pub base_policy_id: BasePolicyId,
    pub insurance_provider_id: String,
    pub farm_id: FarmId,
    pub farmer_id: String,
    pub coverage_amount: Decimal,
    pub coverage_start_date: DateTime<Utc>,
    pub coverage_end_date: DateTime<Utc>,
    /// Insured hectares; multiplies per-hectare payouts.
    pub area_multiplier: f64,
    pub status: PolicyStatus,
    pub underwriting_status: UnderwritingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegisteredPolicy {
    pub fn is_active(&self) -> bool {
        self.status == PolicyStatus::Active
    }

    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        at >= self.coverage_start_date && at <= self.coverage_end_date
    }

    pub async fn find_by_id(id: PolicyId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM registered_policies WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_active_ids(pool: &PgPool) -> Result<Vec<PolicyId>> {
        sqlx::query_scalar::<_, PolicyId>(
            r#"
            SELECT id FROM registered_policies
            WHERE status = 'active'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Row lock held until the transaction ends. Serializes claim creation
    /// for one policy without blocking foreign-key checks.
    pub async fn lock_for_claims(id: PolicyId, conn: &mut PgConnection) -> Result<bool> {
        let locked = sqlx::query_scalar::<_, PolicyId>(
            "SELECT id FROM registered_policies WHERE id = $1 FOR NO KEY UPDATE",
        )
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(locked.is_some())
    }

    pub async fn find_status(id: PolicyId, pool: &PgPool) -> Result<Option<PolicyStatus>> {
        sqlx::query_scalar::<_, PolicyStatus>(
            "SELECT status FROM registered_policies WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }
}
