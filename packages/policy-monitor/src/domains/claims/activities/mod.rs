pub mod generate;
pub mod lifecycle;

pub use generate::{record_evaluation, ClaimDecision};
pub use lifecycle::{ClaimLifecycle, SweepReport};
