//! Claim amount calculation.
//!
//! ```text
//! area       = area_multiplier if per-hectare, else 1
//! pct        = payout_percentage / 100, else 1
//! fix        = fix_payout_amount * area * pct
//! threshold  = over_threshold_value * over_threshold_multiplier * payout_base_rate * area
//! amount     = min(fix + threshold, payout_cap (if > 0), coverage_amount)
//! ```
//!
//! All results are rounded to 2 decimal places.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::domains::policies::{BasePolicy, RegisteredPolicy};
use crate::domains::triggers::Trigger;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutCalculation {
    pub over_threshold_value: f64,
    pub calculated_fix_payout: Decimal,
    pub calculated_threshold_payout: Decimal,
    pub claim_amount: Decimal,
}

fn decimal(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

pub fn calculate_payout(
    policy: &RegisteredPolicy,
    base_policy: &BasePolicy,
    trigger: &Trigger,
    over_threshold_value: f64,
) -> PayoutCalculation {
    let area = if base_policy.is_payout_per_hectare {
        decimal(policy.area_multiplier)
    } else {
        Decimal::ONE
    };
    let pct = decimal(trigger.payout_fraction());

    let fix = (base_policy.fix_payout_amount * area * pct).round_dp(2);
    let threshold = (decimal(over_threshold_value)
        * base_policy.over_threshold_multiplier
        * base_policy.payout_base_rate
        * area)
        .round_dp(2);

    let mut amount = fix + threshold;
    if let Some(cap) = base_policy.payout_cap.filter(|cap| *cap > Decimal::ZERO) {
        amount = amount.min(cap);
    }
    amount = amount.min(policy.coverage_amount).max(Decimal::ZERO);

    PayoutCalculation {
        over_threshold_value,
        calculated_fix_payout: fix,
        calculated_threshold_payout: threshold,
        claim_amount: amount.round_dp(2),
    }
}
