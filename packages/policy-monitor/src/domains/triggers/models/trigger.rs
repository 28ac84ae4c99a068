use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::closed_enum;
use crate::common::{BasePolicyId, FrequencyUnit, MonitorCadence, TriggerId};
use crate::domains::triggers::blackout::BlackoutPeriods;
use crate::domains::triggers::error::EvaluationError;

closed_enum! {
    /// How a trigger combines its condition results.
    pub enum LogicalOperator as "logical operator" {
        And => "AND",
        Or => "OR",
    }
}

impl LogicalOperator {
    /// An empty list is false under both operators.
    pub fn combine(&self, results: &[bool]) -> bool {
        if results.is_empty() {
            return false;
        }
        match self {
            LogicalOperator::And => results.iter().all(|passed| *passed),
            LogicalOperator::Or => results.iter().any(|passed| *passed),
        }
    }
}

/// Payout trigger of a base policy product.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trigger {
    pub id: TriggerId,
    pub base_policy_id: BasePolicyId,
    pub logical_operator: LogicalOperator,
    pub payout_percentage: Option<f64>,
    pub growth_stage: Option<String>,
    /// Days after coverage start the trigger becomes valid.
    pub valid_from_day: Option<i32>,
    pub valid_to_day: Option<i32>,
    pub monitor_interval: i32,
    pub monitor_frequency_unit: FrequencyUnit,
    pub blackout_periods: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn cadence(&self) -> MonitorCadence {
        MonitorCadence::new(
            u32::try_from(self.monitor_interval).unwrap_or(1),
            self.monitor_frequency_unit,
        )
    }

    pub fn blackout(&self) -> Result<BlackoutPeriods, EvaluationError> {
        match &self.blackout_periods {
            None | Some(serde_json::Value::Null) => Ok(BlackoutPeriods::default()),
            Some(raw) => BlackoutPeriods::from_json(raw),
        }
    }

    /// Whether `now` lies inside the growth-stage window anchored at the
    /// policy's coverage start. Open ends are unbounded.
    pub fn in_growth_stage(&self, coverage_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if let Some(from) = self.valid_from_day {
            if now < coverage_start + Duration::days(i64::from(from)) {
                return false;
            }
        }
        if let Some(to) = self.valid_to_day {
            if now > coverage_start + Duration::days(i64::from(to)) {
                return false;
            }
        }
        true
    }

    /// `payout_percentage / 100`, or 1 when unset.
    pub fn payout_fraction(&self) -> f64 {
        self.payout_percentage.map(|p| p / 100.0).unwrap_or(1.0)
    }

    pub async fn find_for_base_policy(
        base_policy_id: BasePolicyId,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM base_policy_triggers
            WHERE base_policy_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(base_policy_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
