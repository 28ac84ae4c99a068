//! Claim state machine.
//!
//! ```text
//! generated ──► pending_partner_review ──► approved ──► paid
//!     │                  │
//!     └──────────────────┴──► rejected
//! ```
//!
//! Every approval, by partner or by the deadline sweep, creates the claim's
//! payout in the same transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::common::{ClaimId, PayoutId};
use crate::domains::claims::error::{ClaimError, ClaimResult};
use crate::domains::claims::models::{Claim, ClaimStatus, PartnerDecision, Payout, PayoutStatus};
use crate::domains::claims::store::ClaimStore;
use crate::domains::policies::{PolicyCatalog, DEFAULT_CURRENCY};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub approved: Vec<ClaimId>,
    /// Claims decided by someone else between the read and the write.
    pub skipped: usize,
    pub failed: usize,
}

pub struct ClaimLifecycle {
    store: Arc<dyn ClaimStore>,
    catalog: Arc<dyn PolicyCatalog>,
}

impl ClaimLifecycle {
    pub fn new(store: Arc<dyn ClaimStore>, catalog: Arc<dyn PolicyCatalog>) -> Self {
        Self { store, catalog }
    }

    async fn load(&self, id: ClaimId) -> ClaimResult<Claim> {
        self.store
            .find_claim(id)
            .await?
            .ok_or(ClaimError::NotFound(id))
    }

    fn check(claim: &Claim, to: ClaimStatus) -> ClaimResult<()> {
        if claim.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(ClaimError::InvalidTransition {
                claim_id: claim.id,
                from: claim.status,
                to,
            })
        }
    }

    /// Persist `next` if the row is still in `from`; a lost race surfaces
    /// as an invalid transition from `from`.
    async fn commit(
        &self,
        next: &Claim,
        from: ClaimStatus,
        payout: Option<&Payout>,
    ) -> ClaimResult<()> {
        if self.store.transition_claim(next, from, payout).await? {
            Ok(())
        } else {
            Err(ClaimError::InvalidTransition {
                claim_id: next.id,
                from,
                to: next.status,
            })
        }
    }

    async fn payout_for(&self, claim: &Claim, now: DateTime<Utc>) -> ClaimResult<Payout> {
        let policy = self
            .catalog
            .find_policy(claim.registered_policy_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("registered policy {} not found", claim.registered_policy_id)
            })?;
        let currency = self
            .catalog
            .find_base_policy(claim.base_policy_id)
            .await?
            .map(|base| base.currency().to_string())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

        Ok(Payout {
            id: PayoutId::new(),
            claim_id: claim.id,
            registered_policy_id: claim.registered_policy_id,
            farm_id: claim.farm_id,
            farmer_id: policy.farmer_id,
            payout_amount: claim.claim_amount,
            currency,
            status: PayoutStatus::Pending,
            initiated_at: now,
            completed_at: None,
            created_at: now,
        })
    }

    pub async fn submit_for_review(&self, id: ClaimId, now: DateTime<Utc>) -> ClaimResult<Claim> {
        let claim = self.load(id).await?;
        Self::check(&claim, ClaimStatus::PendingPartnerReview)?;

        let mut next = claim.clone();
        next.status = ClaimStatus::PendingPartnerReview;
        next.updated_at = now;
        self.commit(&next, claim.status, None).await?;

        info!(claim_id = %id, "claim submitted for partner review");
        Ok(next)
    }

    /// Apply a partner's `approved` / `rejected` decision.
    pub async fn record_partner_decision(
        &self,
        id: ClaimId,
        decision: &str,
        reviewed_by: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> ClaimResult<Claim> {
        let decision: PartnerDecision = decision
            .parse()
            .map_err(|_| ClaimError::InvalidDecision(decision.to_string()))?;
        let claim = self.load(id).await?;
        let to = decision.status();
        if !claim.status.is_undecided() {
            return Err(ClaimError::InvalidTransition {
                claim_id: id,
                from: claim.status,
                to,
            });
        }
        Self::check(&claim, to)?;

        let mut next = claim.clone();
        next.status = to;
        next.partner_decision = Some(decision);
        next.partner_review_timestamp = Some(now);
        next.reviewed_by = Some(reviewed_by.to_string());
        next.partner_notes = notes;
        next.updated_at = now;

        let payout = match decision {
            PartnerDecision::Approved => Some(self.payout_for(&next, now).await?),
            PartnerDecision::Rejected => None,
        };
        self.commit(&next, claim.status, payout.as_ref()).await?;

        info!(
            claim_id = %id,
            decision = %decision,
            reviewed_by = %reviewed_by,
            "partner decision recorded"
        );
        Ok(next)
    }

    /// `approved -> paid`, completing the payout.
    pub async fn mark_paid(&self, id: ClaimId, now: DateTime<Utc>) -> ClaimResult<Claim> {
        let claim = self.load(id).await?;
        Self::check(&claim, ClaimStatus::Paid)?;

        let mut next = claim.clone();
        next.status = ClaimStatus::Paid;
        next.updated_at = now;
        if !self.store.mark_claim_paid(&next, now).await? {
            return Err(ClaimError::InvalidTransition {
                claim_id: id,
                from: ClaimStatus::Approved,
                to: ClaimStatus::Paid,
            });
        }

        info!(claim_id = %id, "claim paid");
        Ok(next)
    }

    /// Approve every undecided claim whose deadline has passed. One claim
    /// failing never stops the sweep.
    pub async fn auto_approve_expired(&self, now: DateTime<Utc>) -> ClaimResult<SweepReport> {
        let due = self.store.auto_approvable_claims(now).await?;
        let mut report = SweepReport {
            examined: due.len(),
            ..Default::default()
        };

        for claim in due.into_iter().filter(|c| c.is_auto_approvable(now)) {
            match self.auto_approve(&claim, now).await {
                Ok(true) => report.approved.push(claim.id),
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(claim_id = %claim.id, error = %e, "auto-approval failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            approved = report.approved.len(),
            skipped = report.skipped,
            failed = report.failed,
            "claim auto-approval sweep complete"
        );
        Ok(report)
    }

    async fn auto_approve(&self, claim: &Claim, now: DateTime<Utc>) -> ClaimResult<bool> {
        let mut next = claim.clone();
        next.status = ClaimStatus::Approved;
        next.auto_approved = true;
        next.updated_at = now;

        let payout = self.payout_for(&next, now).await?;
        let approved = self
            .store
            .transition_claim(&next, claim.status, Some(&payout))
            .await?;
        if approved {
            info!(
                claim_id = %claim.id,
                payout_id = %payout.id,
                amount = %payout.payout_amount,
                "claim auto-approved"
            );
        }
        Ok(approved)
    }
}
