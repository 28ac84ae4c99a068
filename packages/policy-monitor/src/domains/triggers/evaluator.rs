//! Trigger evaluation.
//!
//! A pure function of the trigger definition, the measurement series, the
//! evaluation time, and the prior condition streaks. Nothing here touches
//! the database or the clock; callers load inputs and persist outputs.
//!
//! # Windows
//!
//! ```text
//!   now - baseline - agg        now - agg                 now
//!        |------ baseline ------)|-------- current -------|
//! ```
//!
//! The current window ignores measurements taken before coverage started.
//! The baseline window is historical and does not.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::error::EvaluationError;
use super::models::{
    AggregationFunction, ConditionStreak, ThresholdOperator, Trigger, TriggerCondition,
};
use crate::closed_enum;
use crate::common::{ConditionId, DataSourceId, PolicyId, TriggerId};

pub const DEFAULT_EPSILON: f64 = 1e-9;

closed_enum! {
    /// Which operators compare against `value - baseline`.
    pub enum BaselineMode as "baseline mode" {
        ChangeOperatorsOnly => "change_operators_only",
        AllOperators => "all_operators",
    }
}

impl Default for BaselineMode {
    fn default() -> Self {
        BaselineMode::ChangeOperatorsOnly
    }
}

impl BaselineMode {
    pub fn subtracts_baseline(&self, operator: ThresholdOperator) -> bool {
        match self {
            BaselineMode::ChangeOperatorsOnly => operator.is_change(),
            BaselineMode::AllOperators => true,
        }
    }
}

closed_enum! {
    /// Why a pass evaluated no conditions.
    pub enum SkipReason as "skip reason" {
        BlackoutPeriod => "blackout_period",
        OutsideGrowthStage => "outside_growth_stage",
    }
}

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EvaluatorConfig {
    #[builder(default)]
    pub baseline_mode: BaselineMode,
    #[builder(default = DEFAULT_EPSILON)]
    pub epsilon: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One reading of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Everything one evaluation pass reads.
pub struct EvaluationInput<'a> {
    pub policy_id: PolicyId,
    pub trigger: &'a Trigger,
    pub conditions: &'a [TriggerCondition],
    pub series: &'a HashMap<DataSourceId, Vec<Measurement>>,
    pub streaks: &'a HashMap<ConditionId, ConditionStreak>,
    pub coverage_start: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionResult {
    pub condition_id: ConditionId,
    pub condition_order: i32,
    pub data_source_id: DataSourceId,
    pub threshold_operator: ThresholdOperator,
    pub threshold_value: f64,
    pub aggregation_function: AggregationFunction,
    pub aggregated_value: f64,
    pub baseline_value: Option<f64>,
    /// The value actually compared against the threshold.
    pub effective_value: f64,
    pub comparison_passed: bool,
    pub passed: bool,
    pub data_points: usize,
    pub streak_count: Option<i32>,
    pub required_cycles: Option<i32>,
}

impl ConditionResult {
    pub fn over_threshold(&self) -> f64 {
        (self.effective_value - self.threshold_value).abs()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerEvaluation {
    pub policy_id: PolicyId,
    pub trigger_id: TriggerId,
    pub evaluated_at: DateTime<Utc>,
    pub result: bool,
    pub skip_reason: Option<SkipReason>,
    pub conditions: Vec<ConditionResult>,
    /// Updated streaks of consecutive-pass conditions, to be persisted.
    #[serde(skip)]
    pub streaks: Vec<ConditionStreak>,
    /// Longest condition lookback in days.
    pub evaluation_window_days: i32,
}

impl TriggerEvaluation {
    pub fn conditions_evaluated(&self) -> i32 {
        i32::try_from(self.conditions.len()).unwrap_or(i32::MAX)
    }

    pub fn conditions_met(&self) -> i32 {
        i32::try_from(self.conditions.iter().filter(|c| c.passed).count()).unwrap_or(i32::MAX)
    }

    pub fn data_sources_queried(&self) -> i32 {
        let distinct: HashSet<DataSourceId> =
            self.conditions.iter().map(|c| c.data_source_id).collect();
        i32::try_from(distinct.len()).unwrap_or(i32::MAX)
    }

    /// Largest distance past the threshold among passing conditions.
    pub fn over_threshold_value(&self) -> Option<f64> {
        self.conditions
            .iter()
            .filter(|c| c.passed)
            .map(ConditionResult::over_threshold)
            .reduce(f64::max)
    }

    pub fn evaluation_window(&self) -> Duration {
        Duration::days(i64::from(self.evaluation_window_days))
    }

    pub fn condition_details(&self) -> serde_json::Value {
        serde_json::to_value(&self.conditions).unwrap_or(serde_json::Value::Null)
    }
}

/// Cycles a consecutive condition must hold: `ceil(window / interval)`,
/// at least one.
pub fn required_cycles(validation_window_days: i32, interval: Duration) -> i32 {
    let window_secs = i64::from(validation_window_days.max(0)) * 86_400;
    let interval_secs = interval.num_seconds().max(1);
    let cycles = (window_secs + interval_secs - 1) / interval_secs;
    i32::try_from(cycles).unwrap_or(i32::MAX).max(1)
}

fn values_in(
    series: &[Measurement],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    inclusive_end: bool,
) -> Vec<f64> {
    let mut points: Vec<&Measurement> = series
        .iter()
        .filter(|m| {
            m.timestamp >= from && (m.timestamp < to || (inclusive_end && m.timestamp == to))
        })
        .collect();
    points.sort_by_key(|m| m.timestamp);
    points.into_iter().map(|m| m.value).collect()
}

pub fn evaluate_trigger(
    input: &EvaluationInput<'_>,
    config: &EvaluatorConfig,
) -> Result<TriggerEvaluation, EvaluationError> {
    for condition in input.conditions {
        condition.validate()?;
    }
    let blackout = input.trigger.blackout()?;

    let mut conditions: Vec<&TriggerCondition> = input.conditions.iter().collect();
    conditions.sort_by_key(|c| c.condition_order);

    let mut evaluation = TriggerEvaluation {
        policy_id: input.policy_id,
        trigger_id: input.trigger.id,
        evaluated_at: input.now,
        result: false,
        skip_reason: None,
        conditions: Vec::with_capacity(conditions.len()),
        streaks: Vec::new(),
        evaluation_window_days: conditions
            .iter()
            .map(|c| c.lookback_days())
            .max()
            .unwrap_or(0),
    };

    if blackout.is_blacked_out(input.now) {
        evaluation.skip_reason = Some(SkipReason::BlackoutPeriod);
        return Ok(evaluation);
    }
    if !input.trigger.in_growth_stage(input.coverage_start, input.now) {
        evaluation.skip_reason = Some(SkipReason::OutsideGrowthStage);
        return Ok(evaluation);
    }

    let interval = input.trigger.cadence().to_chrono();
    for condition in conditions {
        let (result, streak) = evaluate_condition(condition, input, interval, config);
        evaluation.conditions.push(result);
        evaluation.streaks.extend(streak);
    }

    let passed: Vec<bool> = evaluation.conditions.iter().map(|c| c.passed).collect();
    evaluation.result = input.trigger.logical_operator.combine(&passed);
    Ok(evaluation)
}

fn evaluate_condition(
    condition: &TriggerCondition,
    input: &EvaluationInput<'_>,
    interval: Duration,
    config: &EvaluatorConfig,
) -> (ConditionResult, Option<ConditionStreak>) {
    let now = input.now;
    let series = input
        .series
        .get(&condition.data_source_id)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let window_start = now - Duration::days(i64::from(condition.aggregation_window_days));
    let current = values_in(series, window_start.max(input.coverage_start), now, true);
    let aggregated = condition.aggregation_function.apply(&current);

    let baseline = condition.baseline_window_days.map(|days| {
        let baseline_start = window_start - Duration::days(i64::from(days));
        let values = values_in(series, baseline_start, window_start, false);
        condition.effective_baseline_function().apply(&values)
    });

    let effective = match baseline {
        Some(b) if config.baseline_mode.subtracts_baseline(condition.threshold_operator) => {
            aggregated - b
        }
        _ => aggregated,
    };
    let comparison_passed =
        condition
            .threshold_operator
            .compare(effective, condition.threshold_value, config.epsilon);

    let mut result = ConditionResult {
        condition_id: condition.id,
        condition_order: condition.condition_order,
        data_source_id: condition.data_source_id,
        threshold_operator: condition.threshold_operator,
        threshold_value: condition.threshold_value,
        aggregation_function: condition.aggregation_function,
        aggregated_value: aggregated,
        baseline_value: baseline,
        effective_value: effective,
        comparison_passed,
        passed: comparison_passed,
        data_points: current.len(),
        streak_count: None,
        required_cycles: None,
    };

    if !condition.consecutive_required {
        return (result, None);
    }

    let prior = input.streaks.get(&condition.id);
    let carried = prior
        .map(|s| s.carried_count(now, condition.validation_window_days))
        .unwrap_or(0);
    // A rerun of a cycle already counted (retry, redelivery, ad-hoc run)
    // keeps the cycle's anchor and never adds to the count.
    let same_cycle = prior.filter(|s| s.same_cycle(now, interval));
    let streak = if comparison_passed {
        let count = match same_cycle {
            Some(_) => carried.max(1),
            None => carried.saturating_add(1),
        };
        ConditionStreak {
            registered_policy_id: input.policy_id,
            condition_id: condition.id,
            streak_count: count,
            streak_started_at: prior
                .filter(|_| carried > 0)
                .and_then(|s| s.streak_started_at)
                .or(Some(now)),
            last_evaluated_at: same_cycle.map_or(now, |s| s.last_evaluated_at),
        }
    } else {
        ConditionStreak {
            registered_policy_id: input.policy_id,
            condition_id: condition.id,
            streak_count: 0,
            streak_started_at: None,
            last_evaluated_at: same_cycle.map_or(now, |s| s.last_evaluated_at),
        }
    };

    let required = required_cycles(condition.validation_window_days, interval);
    result.passed = comparison_passed && streak.streak_count >= required;
    result.streak_count = Some(streak.streak_count);
    result.required_cycles = Some(required);
    (result, Some(streak))
}
