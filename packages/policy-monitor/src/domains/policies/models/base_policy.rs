use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::BasePolicyId;

pub const DEFAULT_CURRENCY: &str = "VND";

/// Product template: payout terms shared by every policy sold from it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BasePolicy {
    pub id: BasePolicyId,
    pub insurance_provider_id: String,
    pub product_name: String,
    pub crop_type: String,
    pub coverage_currency: String,
    pub fix_payout_amount: Decimal,
    pub is_payout_per_hectare: bool,
    pub over_threshold_multiplier: Decimal,
    pub payout_base_rate: Decimal,
    /// Ignored unless positive.
    pub payout_cap: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BasePolicy {
    pub fn currency(&self) -> &str {
        if self.coverage_currency.trim().is_empty() {
            DEFAULT_CURRENCY
        } else {
            &self.coverage_currency
        }
    }

    pub async fn find_by_id(id: BasePolicyId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM base_policies WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }
}
