use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

use crate::closed_enum;
use crate::common::{ClaimId, FarmId, PayoutId, PolicyId};

closed_enum! {
    pub enum PayoutStatus as "payout status" {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

/// Money owed for an approved claim. At most one per claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payout {
    pub id: PayoutId,
    pub claim_id: ClaimId,
    pub registered_policy_id: PolicyId,
    pub farm_id: FarmId,
    pub farmer_id: String,
    pub payout_amount: Decimal,
    pub currency: String,
    pub status: PayoutStatus,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Payout {
    pub async fn find_for_claim(claim_id: ClaimId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM payouts WHERE claim_id = $1")
            .bind(claim_id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn insert(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payouts (
                id, claim_id, registered_policy_id, farm_id, farmer_id, payout_amount,
                currency, status, initiated_at, completed_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(self.id)
        .bind(self.claim_id)
        .bind(self.registered_policy_id)
        .bind(self.farm_id)
        .bind(&self.farmer_id)
        .bind(self.payout_amount)
        .bind(&self.currency)
        .bind(self.status)
        .bind(self.initiated_at)
        .bind(self.completed_at)
        .bind(self.created_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn complete_for_claim(
        claim_id: ClaimId,
        at: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payouts SET status = 'completed', completed_at = $2
            WHERE claim_id = $1 AND status <> 'completed'
            "#,
        )
        .bind(claim_id)
        .bind(at)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
