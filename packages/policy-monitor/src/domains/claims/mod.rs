pub mod activities;
pub mod error;
pub mod models;
pub mod payout_formula;
pub mod store;

use chrono::Duration;
use typed_builder::TypedBuilder;

pub use activities::{record_evaluation, ClaimDecision, ClaimLifecycle, SweepReport};
pub use error::{ClaimError, ClaimResult};
pub use models::{
    Claim, ClaimStatus, PartnerDecision, Payout, PayoutStatus, TriggerEvaluationLog,
};
pub use payout_formula::{calculate_payout, PayoutCalculation};
pub use store::{ClaimStore, EvaluationRecord, PostgresClaimStore};

/// Claim generation settings.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ClaimConfig {
    /// Time a partner has to decide before the sweep approves.
    #[builder(default = Duration::hours(72))]
    pub auto_approval_grace: Duration,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
