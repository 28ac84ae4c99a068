//! Job handler registry.
//!
//! Maps each [`JobType`] to the [`JobHandler`] that executes it. Handlers are
//! registered once at startup; re-registering a type replaces the previous
//! handler. Every pool shares one registry, so a registration is visible to
//! pools created before it.
//!
//! ```ignore
//! let registry = JobHandlerRegistry::new();
//! registry.register(
//!     JobType::FarmImagery,
//!     handler_fn(|_ctx, params| async move { Ok(params) }),
//! );
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::error::JobError;
use super::job::JobType;
use crate::common::PolicyId;

/// What a handler knows about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_type: JobType,
    pub policy_id: Option<PolicyId>,
    /// 1-based attempt number.
    pub attempt: i32,
    /// Cancelled when the owning pool is force-stopped.
    pub cancel: CancellationToken,
}

/// Executes one job type. The returned value becomes the execution's
/// `result_summary`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: &JobContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, JobError>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: &JobContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, JobError> {
        (self.f)(ctx.clone(), params.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, returning the handler it replaced.
    pub fn register(
        &self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_type, handler);
        info!(
            job_type = %job_type,
            replaced = previous.is_some(),
            "registered job handler"
        );
        previous
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_type)
            .cloned()
    }

    pub fn is_registered(&self, job_type: JobType) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&job_type)
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        JobType::ALL
            .iter()
            .copied()
            .filter(|t| handlers.contains_key(t))
            .collect()
    }
}
