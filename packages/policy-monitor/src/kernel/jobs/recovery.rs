//! Startup recovery and periodic adoption.
//!
//! Rebuilds pools and schedulers for every active policy from persisted
//! state. One policy failing to recover never stops the others. The same
//! pass, minus the abandoned-work cleanup of the shared AI pool, runs on a
//! schedule to pick up policies activated while the process runs.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::manager::WorkerPoolManager;
use super::state::LifecycleStatus;
use crate::common::PolicyId;
use crate::kernel::BasePolicySource;

pub const ABANDONED_MESSAGE: &str = "abandoned by previous process";

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryFailure {
    pub policy_id: PolicyId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub total: usize,
    pub recovered: usize,
    pub failed: Vec<RecoveryFailure>,
    /// Active pool rows stopped because their policy is no longer active.
    pub reconciled: usize,
    /// Executions the previous process left unfinished.
    pub abandoned_jobs: u64,
    /// Active policies whose pool was already live in this process.
    pub already_running: usize,
}

pub struct RecoveryManager {
    manager: WorkerPoolManager,
    policies: Arc<dyn BasePolicySource>,
}

impl RecoveryManager {
    pub fn new(manager: WorkerPoolManager, policies: Arc<dyn BasePolicySource>) -> Self {
        Self { manager, policies }
    }

    /// Startup pass: fail what the previous process left running in the AI
    /// pool, then adopt every active policy. Errors only when the active
    /// policy list itself cannot be read.
    pub async fn recover_active_policies(&self) -> Result<RecoveryReport> {
        let abandoned_ai = match self
            .manager
            .persistor()
            .fail_unfinished_executions(None, ABANDONED_MESSAGE, Utc::now())
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to fail abandoned AI pool executions");
                0
            }
        };
        if abandoned_ai > 0 {
            info!(abandoned = abandoned_ai, "failed abandoned AI pool executions");
        }

        let mut report = self.adopt_active_policies().await?;
        report.abandoned_jobs += abandoned_ai;
        Ok(report)
    }

    /// Start a pool for every active policy without a live one, and stop
    /// pools of policies that are no longer active. Safe to repeat while
    /// pools are running.
    pub async fn adopt_active_policies(&self) -> Result<RecoveryReport> {
        let policy_ids = self
            .policies
            .active_policy_ids()
            .await
            .context("Failed to load active policies")?;

        let running: HashSet<PolicyId> = self.manager.running_policy_ids().into_iter().collect();
        info!(
            total = policy_ids.len(),
            running = running.len(),
            "recovering worker infrastructure"
        );

        let mut report = RecoveryReport {
            total: policy_ids.len(),
            ..Default::default()
        };

        for &policy_id in &policy_ids {
            if running.contains(&policy_id) {
                report.already_running += 1;
                continue;
            }
            match self.recover_policy(policy_id).await {
                Ok(abandoned) => {
                    report.recovered += 1;
                    report.abandoned_jobs += abandoned;
                }
                Err(e) => {
                    warn!(policy_id = %policy_id, error = %e, "failed to recover policy");
                    report.failed.push(RecoveryFailure {
                        policy_id,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        let active: HashSet<PolicyId> = policy_ids.into_iter().collect();
        report.reconciled = self.reconcile(&active).await;

        info!(
            total = report.total,
            successful = report.recovered,
            failed = report.failed.len(),
            reconciled = report.reconciled,
            abandoned_jobs = report.abandoned_jobs,
            already_running = report.already_running,
            "recovery complete"
        );
        Ok(report)
    }

    async fn recover_policy(&self, policy_id: PolicyId) -> Result<u64> {
        let target = self
            .policies
            .monitor_target(policy_id)
            .await
            .context("Failed to load monitoring target")?;

        let abandoned = self
            .manager
            .persistor()
            .fail_unfinished_executions(Some(policy_id), ABANDONED_MESSAGE, Utc::now())
            .await?;
        if abandoned > 0 {
            info!(policy_id = %policy_id, abandoned, "failed abandoned job executions");
        }

        let handle = self.manager.recover_pool(target).await?;
        info!(policy_id = %policy_id, pool_name = %handle.pool_name, "policy recovered");
        Ok(abandoned)
    }

    /// Stop `active` rows left behind for policies that are no longer active.
    async fn reconcile(&self, active: &HashSet<PolicyId>) -> usize {
        let rows = match self
            .manager
            .persistor()
            .list_pool_states(Some(LifecycleStatus::Active))
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to list active pools for reconciliation");
                return 0;
            }
        };

        let mut reconciled = 0;
        for row in rows.into_iter().filter(|r| !active.contains(&r.policy_id)) {
            match self.manager.stop_pool(row.policy_id).await {
                Ok(()) => {
                    info!(policy_id = %row.policy_id, "stopped pool of inactive policy");
                    reconciled += 1;
                }
                Err(e) => {
                    warn!(policy_id = %row.policy_id, error = %e, "failed to reconcile pool state");
                }
            }
        }
        reconciled
    }
}
