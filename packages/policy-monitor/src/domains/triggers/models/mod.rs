pub mod condition;
pub mod streak;
pub mod trigger;

pub use condition::{AggregationFunction, ThresholdOperator, TriggerCondition};
pub use streak::ConditionStreak;
pub use trigger::{LogicalOperator, Trigger};
