use thiserror::Error;

use crate::common::{ConditionId, UnknownVariant};

/// A trigger definition the evaluator refuses to run.
#[derive(Debug, Clone, Error)]
pub enum EvaluationError {
    #[error("invalid trigger condition {condition_id}: {reason}")]
    InvalidCondition {
        condition_id: ConditionId,
        reason: String,
    },

    #[error("invalid blackout periods: {0}")]
    InvalidBlackout(String),

    #[error(transparent)]
    UnknownVariant(#[from] UnknownVariant),
}

impl EvaluationError {
    pub fn invalid(condition_id: ConditionId, reason: impl Into<String>) -> Self {
        EvaluationError::InvalidCondition {
            condition_id,
            reason: reason.into(),
        }
    }
}
