//! Per-policy monitoring timer.
//!
//! Each tick enqueues one `fetch-farm-monitoring-data` job into the policy's
//! pool and persists `last_run_at`, `next_run_at`, and `run_count`.
//!
//! # Catch-up
//!
//! A scheduler resumed with a `next_run_at` in the past fires once
//! immediately and then keeps its normal cadence from that tick. Missed
//! intervals are never replayed one by one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{JobPayload, JobType, MonitoringFetchParams};
use super::persistor::WorkerPersistor;
use super::pool::WorkerPool;
use super::state::{scheduler_name, LifecycleStatus, MonitorTarget};
use crate::common::PolicyId;
use crate::kernel::BasePolicySource;

/// When the first tick after (re)start should fire.
pub fn first_fire_at(next_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match next_run_at {
        Some(next) if next > now => next,
        _ => now,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Enqueued,
    /// Enqueue failed; the next attempt is one interval later.
    Skipped,
    /// The policy is no longer active and the scheduler archived itself.
    Retired,
}

pub struct PolicyScheduler {
    target: MonitorTarget,
    interval: Duration,
    max_retries: i32,
    persistor: Arc<dyn WorkerPersistor>,
    policies: Arc<dyn BasePolicySource>,
    pool: Arc<WorkerPool>,
    retire_tx: mpsc::UnboundedSender<PolicyId>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PolicyScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target: MonitorTarget,
        interval: Duration,
        max_retries: i32,
        persistor: Arc<dyn WorkerPersistor>,
        policies: Arc<dyn BasePolicySource>,
        pool: Arc<WorkerPool>,
        retire_tx: mpsc::UnboundedSender<PolicyId>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            interval: interval.max(Duration::from_secs(1)),
            max_retries,
            persistor,
            policies,
            pool,
            retire_tx,
            cancel,
            handle: Mutex::new(None),
        })
    }

    pub fn name(&self) -> String {
        scheduler_name(self.target.policy_id)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Start ticking. `resume_from` is the persisted `next_run_at`.
    pub fn start(self: &Arc<Self>, resume_from: Option<DateTime<Utc>>) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let scheduler = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { scheduler.run(resume_from).await }));
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(scheduler = %self.name(), error = %e, "scheduler task failed");
            }
        }
    }

    async fn run(self: Arc<Self>, resume_from: Option<DateTime<Utc>>) {
        let policy_id = self.target.policy_id;
        let mut next = first_fire_at(resume_from, Utc::now());
        info!(
            policy_id = %policy_id,
            scheduler = %self.name(),
            next_run_at = %next,
            interval_secs = self.interval.as_secs(),
            "scheduler started"
        );

        loop {
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if self.tick().await == TickOutcome::Retired {
                break;
            }
            next = Utc::now() + self.chrono_interval();
        }

        debug!(policy_id = %policy_id, "scheduler exited");
    }

    fn chrono_interval(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.interval).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    /// Run one tick now.
    pub async fn tick(&self) -> TickOutcome {
        let policy_id = self.target.policy_id;

        match self.policies.is_policy_active(policy_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.retire().await;
                return TickOutcome::Retired;
            }
            Err(e) => {
                warn!(policy_id = %policy_id, error = %e, "policy status lookup failed, skipping tick");
                return TickOutcome::Skipped;
            }
        }

        let now = Utc::now();
        let params = MonitoringFetchParams {
            policy_id,
            farm_id: self.target.farm_id,
            base_policy_id: self.target.base_policy_id,
            parameters: self.target.parameters.clone(),
            lookback_days: self.target.lookback_days,
            scheduled_at: now,
        };
        let params = match serde_json::to_value(&params) {
            Ok(params) => params,
            Err(e) => {
                error!(policy_id = %policy_id, error = %e, "failed to encode monitoring params");
                return TickOutcome::Skipped;
            }
        };
        let payload = JobPayload::builder()
            .job_type(JobType::FetchFarmMonitoringData)
            .params(params)
            .max_retries(self.max_retries)
            .build();

        match self.pool.enqueue(payload).await {
            Ok(execution_id) => {
                if let Err(e) = self
                    .persistor
                    .record_scheduler_run(policy_id, now, now + self.chrono_interval())
                    .await
                {
                    error!(policy_id = %policy_id, error = %e, "failed to persist scheduler run");
                }
                debug!(
                    policy_id = %policy_id,
                    execution_id = %execution_id,
                    "monitoring fetch enqueued"
                );
                TickOutcome::Enqueued
            }
            Err(e) => {
                warn!(
                    policy_id = %policy_id,
                    error = %e,
                    "failed to enqueue monitoring fetch, next attempt in one interval"
                );
                TickOutcome::Skipped
            }
        }
    }

    /// Persist `stopped` then `archived` and ask the manager to retire the
    /// pool.
    async fn retire(&self) {
        let policy_id = self.target.policy_id;
        warn!(policy_id = %policy_id, "policy no longer active, retiring scheduler");

        let now = Utc::now();
        for status in [LifecycleStatus::Stopped, LifecycleStatus::Archived] {
            if let Err(e) = self
                .persistor
                .set_scheduler_status(policy_id, status, now)
                .await
            {
                error!(policy_id = %policy_id, status = %status, error = %e, "failed to persist scheduler status");
            }
        }

        if self.retire_tx.send(policy_id).is_err() {
            debug!(policy_id = %policy_id, "manager gone, pool not retired");
        }
    }
}
