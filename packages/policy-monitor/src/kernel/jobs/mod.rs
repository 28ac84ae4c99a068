//! Per-policy worker infrastructure.
//!
//! - [`WorkerPoolManager`] - creates, starts, stops, and archives pools
//! - [`WorkerPool`] - bounded FIFO queue drained by N workers
//! - [`PolicyScheduler`] - timer that enqueues monitoring fetches
//! - [`JobExecutor`] - runs one attempt under a timeout, records the outcome
//! - [`RecoveryManager`] - rebuilds everything after a restart
//! - [`WorkerPersistor`] - durable pool, scheduler, and execution state
//!
//! # Architecture
//!
//! ```text
//! RecoveryManager
//!     │
//!     └─► WorkerPoolManager ── one per process, owns the shared AI pool
//!             │
//!             ├─► PolicyScheduler (per policy)
//!             │       └─► tick → enqueue fetch-farm-monitoring-data
//!             │
//!             └─► WorkerPool (per policy)
//!                     └─► JobExecutor → JobHandlerRegistry → JobHandler
//! ```
//!
//! Job handlers live in their domains. This module only routes and records.

mod error;
mod executor;
mod job;
mod manager;
mod persistor;
mod pool;
mod postgres_persistor;
mod recovery;
mod registry;
mod scheduler;
mod state;
pub mod testing;

pub use error::{JobError, WorkerError, WorkerResult};
pub use executor::{ExecutionOutcome, JobExecutor, RetryBackoff};
pub use job::{
    JobPayload, JobStatus, JobType, MonitoredParameter, MonitoringFetchParams, QueuedJob,
    WorkerJobExecution, DEFAULT_MAX_RETRIES,
};
pub use manager::{PoolHandle, PoolStatus, WorkerDefaults, WorkerPoolManager, AI_POOL_NAME};
pub use persistor::WorkerPersistor;
pub use pool::{PoolOptions, PoolSnapshot, WorkerPool, SUBMIT_TIMEOUT};
pub use postgres_persistor::PostgresWorkerPersistor;
pub use recovery::{RecoveryFailure, RecoveryManager, RecoveryReport, ABANDONED_MESSAGE};
pub use registry::{handler_fn, FnHandler, JobContext, JobHandler, JobHandlerRegistry};
pub use scheduler::{first_fire_at, PolicyScheduler, TickOutcome};
pub use state::{
    pool_name, queue_name_base, scheduler_name, LifecycleStatus, MonitorTarget, WorkerPoolState,
    WorkerSchedulerState,
};
