//! A bounded FIFO queue drained by N worker tasks.
//!
//! Every policy gets its own [`WorkerPool`], so one policy's backlog or
//! failures never touch another's. The manager also owns one shared pool
//! (policy id `None`) for AI job types.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{WorkerError, WorkerResult};
use super::executor::{ExecutionOutcome, JobExecutor};
use super::job::{JobPayload, QueuedJob};
use crate::common::{JobExecutionId, PolicyId};

/// How long a submit waits for queue space.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

const STOPPED_BEFORE_RUN: &str = "worker pool stopped before job ran";
const STOPPED_BEFORE_RETRY: &str = "worker pool stopped before retry";

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub name: String,
    pub policy_id: Option<PolicyId>,
    pub num_workers: usize,
    pub queue_capacity: usize,
    /// How long `stop` lets in-flight jobs finish before cancelling them.
    pub grace: Duration,
}

/// Point-in-time view of a running pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub policy_id: Option<PolicyId>,
    pub num_workers: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub accepting: bool,
    pub started: bool,
}

pub struct WorkerPool {
    options: PoolOptions,
    sender: mpsc::Sender<QueuedJob>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedJob>>>,
    executor: Arc<JobExecutor>,
    accepting: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    /// Stops workers from taking new jobs.
    intake: CancellationToken,
    /// Cancels in-flight jobs. Child of the manager's root token.
    hard_stop: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    in_flight: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        options: PoolOptions,
        executor: Arc<JobExecutor>,
        hard_stop: CancellationToken,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(options.queue_capacity.max(1));
        Arc::new(Self {
            options,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            executor,
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            intake: CancellationToken::new(),
            hard_stop,
            tasks: Mutex::new(JoinSet::new()),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn policy_id(&self) -> Option<PolicyId> {
        self.options.policy_id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn the workers. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.is_stopped() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for worker in 0..self.options.num_workers.max(1) {
            let pool = Arc::clone(self);
            tasks.spawn(async move { pool.worker_loop(worker).await });
        }
        info!(
            pool_name = %self.options.name,
            num_workers = self.options.num_workers,
            "worker pool started"
        );
    }

    /// Record the job and put it on the queue. Waits up to [`SUBMIT_TIMEOUT`]
    /// for space.
    pub async fn enqueue(&self, payload: JobPayload) -> WorkerResult<JobExecutionId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(WorkerError::QueueClosed(self.options.name.clone()));
        }

        let job = self
            .executor
            .record_enqueued(self.options.policy_id, payload)
            .await?;
        let execution_id = job.execution_id;

        match self.sender.send_timeout(job, SUBMIT_TIMEOUT).await {
            Ok(()) => Ok(execution_id),
            Err(SendTimeoutError::Timeout(job)) => {
                self.executor
                    .fail_unstarted(&job, "queue full: submit timed out")
                    .await;
                Err(WorkerError::QueueFull(self.options.name.clone()))
            }
            Err(SendTimeoutError::Closed(job)) => {
                self.executor.fail_unstarted(&job, STOPPED_BEFORE_RUN).await;
                Err(WorkerError::QueueClosed(self.options.name.clone()))
            }
        }
    }

    /// Stop taking jobs, let in-flight work finish within the grace period,
    /// then cancel what is left. Jobs still queued are marked failed.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.accepting.store(false, Ordering::SeqCst);
        self.intake.cancel();

        let mut tasks = self.take_tasks();
        let graceful = tokio::select! {
            _ = drain(&mut tasks) => true,
            _ = tokio::time::sleep(self.options.grace) => false,
            _ = self.hard_stop.cancelled() => false,
        };
        if !graceful {
            warn!(
                pool_name = %self.options.name,
                in_flight = self.in_flight.load(Ordering::SeqCst),
                "grace period elapsed, cancelling in-flight jobs"
            );
            self.hard_stop.cancel();
            drain(&mut tasks).await;
        }
        // Retries spawned while the workers were finishing.
        loop {
            let mut late = self.take_tasks();
            if late.is_empty() {
                break;
            }
            drain(&mut late).await;
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut drained = 0usize;
        while let Ok(job) = receiver.try_recv() {
            self.executor.fail_unstarted(&job, STOPPED_BEFORE_RUN).await;
            drained += 1;
        }

        info!(
            pool_name = %self.options.name,
            drained,
            "worker pool stopped"
        );
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            name: self.options.name.clone(),
            policy_id: self.options.policy_id,
            num_workers: self.options.num_workers,
            queued: self
                .sender
                .max_capacity()
                .saturating_sub(self.sender.capacity()),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            accepting: self.accepting.load(Ordering::SeqCst),
            started: self.is_started(),
        }
    }

    fn take_tasks(&self) -> JoinSet<()> {
        let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *guard)
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(pool_name = %self.options.name, worker, "worker started");
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.intake.cancelled() => None,
                    job = receiver.recv() => job,
                }
            };
            let Some(job) = next else { break };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let outcome = self.executor.execute(job, &self.hard_stop).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let ExecutionOutcome::Retry { job, delay } = outcome {
                self.schedule_retry(job, delay).await;
            }
        }
        debug!(pool_name = %self.options.name, worker, "worker exited");
    }

    async fn schedule_retry(self: &Arc<Self>, job: QueuedJob, delay: Duration) {
        if self.intake.is_cancelled() {
            self.executor.fail_unstarted(&job, STOPPED_BEFORE_RETRY).await;
            return;
        }
        let pool = Arc::clone(self);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.spawn(async move {
            tokio::select! {
                _ = pool.intake.cancelled() => {
                    pool.executor.fail_unstarted(&job, STOPPED_BEFORE_RETRY).await;
                }
                _ = tokio::time::sleep(delay) => {
                    let requeued = tokio::select! {
                        sent = pool.sender.send(job.clone()) => sent.is_ok(),
                        _ = pool.intake.cancelled() => false,
                    };
                    if !requeued {
                        pool.executor.fail_unstarted(&job, STOPPED_BEFORE_RETRY).await;
                    }
                }
            }
        });
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}
