use thiserror::Error;

use super::models::ClaimStatus;
use crate::common::ClaimId;

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("claim {0} not found")]
    NotFound(ClaimId),

    #[error("claim {claim_id} cannot move from {from} to {to}")]
    InvalidTransition {
        claim_id: ClaimId,
        from: ClaimStatus,
        to: ClaimStatus,
    },

    #[error("invalid partner decision {0:?}: expected \"approved\" or \"rejected\"")]
    InvalidDecision(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type ClaimResult<T> = Result<T, ClaimError>;
