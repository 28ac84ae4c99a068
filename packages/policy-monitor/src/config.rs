use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::domains::claims::ClaimConfig;
use crate::domains::triggers::{BaselineMode, EvaluatorConfig};
use crate::kernel::jobs::{RetryBackoff, WorkerDefaults};
use crate::kernel::{ForwardingEndpoints, DEFAULT_CLAIM_SWEEP_CRON, DEFAULT_POLICY_ADOPT_CRON};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub database_max_connections: u32,
    pub worker_num_workers: usize,
    pub worker_queue_capacity: usize,
    pub worker_job_timeout_secs: u64,
    pub worker_max_retries: i32,
    pub worker_retry_backoff_base_ms: u64,
    pub worker_retry_backoff_max_secs: u64,
    pub shutdown_grace_secs: u64,
    pub ai_pool_num_workers: usize,
    pub data_provider_base_url: String,
    pub data_provider_api_key: Option<String>,
    pub data_provider_timeout_secs: u64,
    pub claim_auto_approval_grace_hours: i64,
    pub claim_sweep_cron: String,
    pub policy_adopt_cron: String,
    pub baseline_mode: BaselineMode,
    pub document_validation_endpoint: Option<String>,
    pub farm_imagery_endpoint: Option<String>,
}

/// Parse `name`, falling back to `default` when unset.
fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid value, got {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: var_or("PORT", 8080)?,
            database_max_connections: var_or("DATABASE_MAX_CONNECTIONS", 10)?,
            worker_num_workers: var_or("WORKER_NUM_WORKERS", 5)?,
            worker_queue_capacity: var_or("WORKER_QUEUE_CAPACITY", 100)?,
            worker_job_timeout_secs: var_or("WORKER_JOB_TIMEOUT_SECS", 1800)?,
            worker_max_retries: var_or("WORKER_MAX_RETRIES", 3)?,
            worker_retry_backoff_base_ms: var_or("WORKER_RETRY_BACKOFF_BASE_MS", 1000)?,
            worker_retry_backoff_max_secs: var_or("WORKER_RETRY_BACKOFF_MAX_SECS", 3600)?,
            shutdown_grace_secs: var_or("SHUTDOWN_GRACE_SECS", 30)?,
            ai_pool_num_workers: var_or("AI_POOL_NUM_WORKERS", 3)?,
            data_provider_base_url: env::var("DATA_PROVIDER_BASE_URL")
                .context("DATA_PROVIDER_BASE_URL must be set")?,
            data_provider_api_key: optional("DATA_PROVIDER_API_KEY"),
            data_provider_timeout_secs: var_or("DATA_PROVIDER_TIMEOUT_SECS", 30)?,
            claim_auto_approval_grace_hours: var_or("CLAIM_AUTO_APPROVAL_GRACE_HOURS", 72)?,
            claim_sweep_cron: env::var("CLAIM_SWEEP_CRON")
                .unwrap_or_else(|_| DEFAULT_CLAIM_SWEEP_CRON.to_string()),
            policy_adopt_cron: env::var("POLICY_ADOPT_CRON")
                .unwrap_or_else(|_| DEFAULT_POLICY_ADOPT_CRON.to_string()),
            baseline_mode: var_or("BASELINE_MODE", BaselineMode::default())?,
            document_validation_endpoint: optional("DOCUMENT_VALIDATION_ENDPOINT"),
            farm_imagery_endpoint: optional("FARM_IMAGERY_ENDPOINT"),
        })
    }

    pub fn worker_defaults(&self) -> WorkerDefaults {
        WorkerDefaults::builder()
            .num_workers(self.worker_num_workers)
            .queue_capacity(self.worker_queue_capacity)
            .job_timeout(Duration::from_secs(self.worker_job_timeout_secs))
            .max_retries(self.worker_max_retries)
            .backoff(RetryBackoff::new(
                Duration::from_millis(self.worker_retry_backoff_base_ms),
                Duration::from_secs(self.worker_retry_backoff_max_secs),
            ))
            .shutdown_grace(Duration::from_secs(self.shutdown_grace_secs))
            .ai_pool_workers(self.ai_pool_num_workers)
            .build()
    }

    pub fn evaluator_config(&self) -> EvaluatorConfig {
        EvaluatorConfig::builder()
            .baseline_mode(self.baseline_mode)
            .build()
    }

    pub fn claim_config(&self) -> ClaimConfig {
        ClaimConfig::builder()
            .auto_approval_grace(chrono::Duration::hours(self.claim_auto_approval_grace_hours))
            .build()
    }

    pub fn forwarding(&self) -> ForwardingEndpoints {
        ForwardingEndpoints {
            document_validation: self.document_validation_endpoint.clone(),
            farm_imagery: self.farm_imagery_endpoint.clone(),
            timeout: Duration::from_secs(self.data_provider_timeout_secs),
        }
    }

    pub fn data_provider_timeout(&self) -> Duration {
        Duration::from_secs(self.data_provider_timeout_secs)
    }
}
