use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::models::{Claim, ClaimStatus, Payout, TriggerEvaluationLog};
use crate::common::{ClaimId, PolicyId, TriggerId};
use crate::domains::policies::RegisteredPolicy;
use crate::domains::triggers::ConditionStreak;

/// Everything one trigger evaluation writes.
#[derive(Debug, Clone)]
pub struct EvaluationRecord {
    pub log: TriggerEvaluationLog,
    pub streaks: Vec<ConditionStreak>,
    /// Raised unless an open claim on the same trigger was raised after
    /// `open_since`.
    pub candidate: Option<(Claim, DateTime<Utc>)>,
}

/// Claims, payouts, the evaluation audit log and condition streaks.
///
/// Every method that writes more than one row does so atomically.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn find_claim(&self, id: ClaimId) -> Result<Option<Claim>>;

    /// Newest open claim on the trigger raised after `since`.
    async fn find_open_claim(
        &self,
        policy_id: PolicyId,
        trigger_id: TriggerId,
        since: DateTime<Utc>,
    ) -> Result<Option<Claim>>;

    /// Write the streaks, the log and the candidate claim in one
    /// transaction. The open-claim check runs under a per-policy lock in
    /// that same transaction; when it finds one, the candidate is dropped,
    /// the log is marked suppressed and the open claim is returned.
    async fn record_evaluation(&self, record: &EvaluationRecord) -> Result<Option<Claim>>;

    async fn streaks(&self, policy_id: PolicyId) -> Result<Vec<ConditionStreak>>;

    async fn evaluation_logs(
        &self,
        policy_id: PolicyId,
        limit: i64,
    ) -> Result<Vec<TriggerEvaluationLog>>;

    /// Persist `claim`'s new state if the stored row is still `expected`.
    /// A payout, when given, is inserted in the same transaction.
    async fn transition_claim(
        &self,
        claim: &Claim,
        expected: ClaimStatus,
        payout: Option<&Payout>,
    ) -> Result<bool>;

    /// `approved -> paid` plus payout completion, in one transaction.
    async fn mark_claim_paid(&self, claim: &Claim, at: DateTime<Utc>) -> Result<bool>;

    async fn auto_approvable_claims(&self, now: DateTime<Utc>) -> Result<Vec<Claim>>;

    async fn find_payout(&self, claim_id: ClaimId) -> Result<Option<Payout>>;
}

pub struct PostgresClaimStore {
    pool: PgPool,
}

impl PostgresClaimStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClaimStore for PostgresClaimStore {
    async fn find_claim(&self, id: ClaimId) -> Result<Option<Claim>> {
        Claim::find_by_id(id, &self.pool).await
    }

    async fn find_open_claim(
        &self,
        policy_id: PolicyId,
        trigger_id: TriggerId,
        since: DateTime<Utc>,
    ) -> Result<Option<Claim>> {
        let mut conn = self.pool.acquire().await?;
        Claim::find_open_since(policy_id, trigger_id, since, &mut conn).await
    }

    async fn record_evaluation(&self, record: &EvaluationRecord) -> Result<Option<Claim>> {
        let mut log = record.log.clone();
        let mut open = None;

        let mut tx = self.pool.begin().await?;
        if let Some((claim, open_since)) = &record.candidate {
            RegisteredPolicy::lock_for_claims(claim.registered_policy_id, &mut *tx).await?;
            open = Claim::find_open_since(
                claim.registered_policy_id,
                claim.base_policy_trigger_id,
                *open_since,
                &mut *tx,
            )
            .await?;
            match &open {
                Some(existing) => log.mark_suppressed(existing.id),
                None => {
                    claim.insert(&mut *tx).await?;
                    log.link_claim(claim.id);
                }
            }
        }
        for streak in &record.streaks {
            streak.upsert(&mut *tx).await?;
        }
        log.insert(&mut *tx).await?;
        tx.commit().await?;
        Ok(open)
    }

    async fn streaks(&self, policy_id: PolicyId) -> Result<Vec<ConditionStreak>> {
        ConditionStreak::find_for_policy(policy_id, &self.pool).await
    }

    async fn evaluation_logs(
        &self,
        policy_id: PolicyId,
        limit: i64,
    ) -> Result<Vec<TriggerEvaluationLog>> {
        TriggerEvaluationLog::find_for_policy(policy_id, limit, &self.pool).await
    }

    async fn transition_claim(
        &self,
        claim: &Claim,
        expected: ClaimStatus,
        payout: Option<&Payout>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !claim.update_if_status(expected, &mut *tx).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Some(payout) = payout {
            payout.insert(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn mark_claim_paid(&self, claim: &Claim, at: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !claim.update_if_status(ClaimStatus::Approved, &mut *tx).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        Payout::complete_for_claim(claim.id, at, &mut *tx).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn auto_approvable_claims(&self, now: DateTime<Utc>) -> Result<Vec<Claim>> {
        Claim::find_auto_approvable(now, &self.pool).await
    }

    async fn find_payout(&self, claim_id: ClaimId) -> Result<Option<Payout>> {
        Payout::find_for_claim(claim_id, &self.pool).await
    }
}
