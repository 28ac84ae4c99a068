//! Error types for the worker subsystem.

use std::time::Duration;

use thiserror::Error;

use crate::common::PolicyId;

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failures of pool, scheduler, and persistence operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker pool already exists for policy {0}")]
    PoolAlreadyExists(PolicyId),

    #[error("worker pool for policy {0} is archived")]
    PoolArchived(PolicyId),

    #[error("no worker pool for policy {0}")]
    PoolNotFound(PolicyId),

    #[error("invalid {entity} transition for policy {policy_id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        policy_id: PolicyId,
        from: &'static str,
        to: &'static str,
    },

    #[error("queue {0} is not accepting jobs")]
    QueueClosed(String),

    #[error("queue {0} is full")]
    QueueFull(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Outcome of a failed handler invocation.
///
/// Only [`JobError::Transient`] and [`JobError::Timeout`] are retried.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0:#}")]
    Transient(anyhow::Error),

    #[error("{0:#}")]
    Permanent(anyhow::Error),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("job cancelled by shutdown")]
    Cancelled,
}

impl JobError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        JobError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        JobError::Permanent(err.into())
    }

    pub fn should_retry(&self) -> bool {
        matches!(self, JobError::Transient(_) | JobError::Timeout(_))
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Transient(_) => "transient",
            JobError::Permanent(_) => "permanent",
            JobError::Timeout(_) => "timeout",
            JobError::Cancelled => "cancelled",
        }
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        JobError::Transient(err.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Transient(err)
    }
}
