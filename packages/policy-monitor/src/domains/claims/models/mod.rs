pub mod claim;
pub mod evaluation_log;
pub mod payout;

pub use claim::{claim_number, Claim, ClaimStatus, PartnerDecision};
pub use evaluation_log::TriggerEvaluationLog;
pub use payout::{Payout, PayoutStatus};
