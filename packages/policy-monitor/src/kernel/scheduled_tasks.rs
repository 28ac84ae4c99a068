//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! These run beside the per-policy schedulers, which own monitoring cadence.
//!
//! ```text
//! Scheduler
//!     │
//!     ├─► CLAIM_SWEEP_CRON (every 5 minutes by default)
//!     │     └─► ClaimLifecycle::auto_approve_expired(now)
//!     │           └─► For each undecided claim past its deadline → approve + payout
//!     │
//!     └─► POLICY_ADOPT_CRON (every minute by default)
//!           └─► RecoveryManager::adopt_active_policies()
//!                 ├─► Active policy without a live pool → create + start
//!                 └─► Live pool whose policy left `active` → stop
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::domains::claims::ClaimLifecycle;
use crate::kernel::jobs::RecoveryManager;

pub const DEFAULT_CLAIM_SWEEP_CRON: &str = "0 */5 * * * *";
pub const DEFAULT_POLICY_ADOPT_CRON: &str = "30 * * * * *";

/// Start all scheduled tasks
pub async fn start_scheduler(
    lifecycle: Arc<ClaimLifecycle>,
    sweep_cron: &str,
    recovery: Arc<RecoveryManager>,
    adopt_cron: &str,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .context("Failed to create cron scheduler")?;

    let sweep_job = Job::new_async(sweep_cron, move |_uuid, _lock| {
        let lifecycle = lifecycle.clone();
        Box::pin(async move {
            if let Err(e) = run_claim_sweep(&lifecycle).await {
                tracing::error!(error = %e, "claim auto-approval sweep failed");
            }
        })
    })
    .with_context(|| format!("Invalid claim sweep schedule {:?}", sweep_cron))?;

    let adopt_job = Job::new_async(adopt_cron, move |_uuid, _lock| {
        let recovery = recovery.clone();
        Box::pin(async move {
            if let Err(e) = run_policy_adoption(&recovery).await {
                tracing::error!(error = %e, "policy adoption failed");
            }
        })
    })
    .with_context(|| format!("Invalid policy adoption schedule {:?}", adopt_cron))?;

    scheduler.add(sweep_job).await?;
    scheduler.add(adopt_job).await?;
    scheduler.start().await?;

    tracing::info!(
        sweep_cron = %sweep_cron,
        adopt_cron = %adopt_cron,
        "scheduled tasks started (claim auto-approval sweep, policy adoption)"
    );
    Ok(scheduler)
}

/// Approve every undecided claim whose partner review deadline has passed.
async fn run_claim_sweep(lifecycle: &ClaimLifecycle) -> Result<()> {
    let report = lifecycle.auto_approve_expired(Utc::now()).await?;
    if report.examined > 0 {
        tracing::debug!(
            approved = report.approved.len(),
            failed = report.failed,
            "claim sweep tick"
        );
    }
    Ok(())
}

/// Start pools for policies activated since the last pass.
async fn run_policy_adoption(recovery: &RecoveryManager) -> Result<()> {
    let report = recovery.adopt_active_policies().await?;
    if report.recovered > 0 || report.reconciled > 0 || !report.failed.is_empty() {
        tracing::info!(
            adopted = report.recovered,
            stopped = report.reconciled,
            failed = report.failed.len(),
            "policy adoption tick"
        );
    }
    Ok(())
}
