pub mod blackout;
pub mod error;
pub mod evaluator;
pub mod models;

pub use blackout::{BlackoutPeriod, BlackoutPeriods, MonthDay};
pub use error::EvaluationError;
pub use evaluator::{
    evaluate_trigger, required_cycles, BaselineMode, ConditionResult, EvaluationInput,
    EvaluatorConfig, Measurement, SkipReason, TriggerEvaluation, DEFAULT_EPSILON,
};
pub use models::{
    AggregationFunction, ConditionStreak, LogicalOperator, ThresholdOperator, Trigger,
    TriggerCondition,
};
