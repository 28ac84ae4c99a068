use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::closed_enum;
use crate::common::{ConditionId, DataSourceId, TriggerId};
use crate::domains::triggers::error::EvaluationError;

closed_enum! {
    pub enum ThresholdOperator as "threshold operator" {
        LessThan => "<",
        GreaterThan => ">",
        LessThanOrEqual => "<=",
        GreaterThanOrEqual => ">=",
        Equal => "==",
        NotEqual => "!=",
        ChangeGreaterThan => "change_gt",
        ChangeLessThan => "change_lt",
    }
}

impl ThresholdOperator {
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            ThresholdOperator::ChangeGreaterThan | ThresholdOperator::ChangeLessThan
        )
    }

    /// `==` and `!=` compare within `epsilon`.
    pub fn compare(&self, value: f64, threshold: f64, epsilon: f64) -> bool {
        match self {
            ThresholdOperator::LessThan | ThresholdOperator::ChangeLessThan => value < threshold,
            ThresholdOperator::GreaterThan | ThresholdOperator::ChangeGreaterThan => {
                value > threshold
            }
            ThresholdOperator::LessThanOrEqual => value <= threshold,
            ThresholdOperator::GreaterThanOrEqual => value >= threshold,
            ThresholdOperator::Equal => (value - threshold).abs() <= epsilon,
            ThresholdOperator::NotEqual => (value - threshold).abs() > epsilon,
        }
    }
}

closed_enum! {
    pub enum AggregationFunction as "aggregation function" {
        Sum => "sum",
        Avg => "avg",
        Min => "min",
        Max => "max",
        Change => "change",
    }
}

impl AggregationFunction {
    /// Aggregate values ordered by time. Empty input is `0`; `change` needs
    /// two points and is `0` otherwise.
    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            AggregationFunction::Sum => values.iter().sum(),
            AggregationFunction::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregationFunction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregationFunction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregationFunction::Change => match (values.first(), values.last()) {
                (Some(first), Some(last)) if values.len() >= 2 => last - first,
                _ => 0.0,
            },
        }
    }
}

/// One ordered check of a trigger against a single data source.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TriggerCondition {
    pub id: ConditionId,
    pub base_policy_trigger_id: TriggerId,
    pub data_source_id: DataSourceId,
    pub threshold_operator: ThresholdOperator,
    pub threshold_value: f64,
    pub aggregation_function: AggregationFunction,
    pub aggregation_window_days: i32,
    pub consecutive_required: bool,
    pub baseline_window_days: Option<i32>,
    pub baseline_function: Option<AggregationFunction>,
    pub validation_window_days: i32,
    pub condition_order: i32,
    pub created_at: DateTime<Utc>,
}

impl TriggerCondition {
    pub fn validate(&self) -> Result<(), EvaluationError> {
        if self.aggregation_window_days <= 0 {
            return Err(EvaluationError::invalid(
                self.id,
                format!(
                    "aggregation_window_days must be positive, got {}",
                    self.aggregation_window_days
                ),
            ));
        }
        if self.consecutive_required && self.validation_window_days < self.aggregation_window_days
        {
            return Err(EvaluationError::invalid(
                self.id,
                format!(
                    "validation_window_days ({}) must be at least aggregation_window_days ({}) when consecutive passes are required",
                    self.validation_window_days, self.aggregation_window_days
                ),
            ));
        }
        if let Some(days) = self.baseline_window_days {
            if days <= 0 {
                return Err(EvaluationError::invalid(
                    self.id,
                    format!("baseline_window_days must be positive, got {}", days),
                ));
            }
        }
        Ok(())
    }

    pub fn effective_baseline_function(&self) -> AggregationFunction {
        self.baseline_function.unwrap_or(self.aggregation_function)
    }

    /// Days of history this condition reads, baseline included.
    pub fn lookback_days(&self) -> i32 {
        self.aggregation_window_days + self.baseline_window_days.unwrap_or(0)
    }

    /// Ordered by `condition_order`.
    pub async fn find_for_trigger(trigger_id: TriggerId, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM base_policy_trigger_conditions
            WHERE base_policy_trigger_id = $1
            ORDER BY condition_order ASC, created_at ASC
            "#,
        )
        .bind(trigger_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
