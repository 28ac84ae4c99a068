//! Operator CLI for the policy monitor
//!
//! Adjusts persisted worker and claim state without going through the
//! service. Every command prints one JSON document.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use policy_monitor_core::common::{ClaimId, PolicyId};
use policy_monitor_core::domains::claims::ClaimStore;
use policy_monitor_core::kernel::jobs::{WorkerError, WorkerPersistor, WorkerPoolManager};
use policy_monitor_core::kernel::{BasePolicySource, HttpDataProvider, MonitorDeps};
use policy_monitor_core::Config;
use serde::Serialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;

#[derive(Parser)]
#[command(name = "monitor_cli")]
#[command(about = "Policy monitor operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (if needed) and start a policy's pool and scheduler
    Start {
        policy_id: PolicyId,
        /// Keep the pool running this many seconds, then shut down cleanly.
        /// With 0 the rows are left active for the service to adopt.
        #[arg(long, default_value_t = 0)]
        run_secs: u64,
    },

    /// Stop a policy's pool and scheduler
    Stop { policy_id: PolicyId },

    /// Archive a policy's pool and scheduler
    Archive { policy_id: PolicyId },

    /// Approve every undecided claim past its auto-approval deadline
    SweepClaims,

    /// Recent job executions for a policy
    Executions {
        policy_id: PolicyId,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Recent trigger evaluation logs for a policy
    Evaluations {
        policy_id: PolicyId,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Move a generated claim to partner review
    Review { claim_id: ClaimId },

    /// Record a partner decision (`approved` or `rejected`)
    Decide {
        claim_id: ClaimId,
        decision: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Mark an approved claim paid
    Pay { claim_id: ClaimId },
}

fn output(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    let deps = connect(&config).await?;

    match cli.command {
        Commands::Start { policy_id, run_secs } => {
            cmd_start(&config, &deps, policy_id, run_secs).await
        }
        Commands::Stop { policy_id } => {
            manager(&config, &deps)?.stop_pool(policy_id).await?;
            output(&json!({ "success": true, "policy_id": policy_id, "status": "stopped" }))
        }
        Commands::Archive { policy_id } => {
            manager(&config, &deps)?.archive_pool(policy_id).await?;
            output(&json!({ "success": true, "policy_id": policy_id, "status": "archived" }))
        }
        Commands::SweepClaims => {
            let report = deps.claim_lifecycle().auto_approve_expired(Utc::now()).await?;
            output(&report)
        }
        Commands::Executions { policy_id, limit } => {
            let executions = deps
                .persistor
                .job_executions_for_policy(policy_id, limit)
                .await?;
            output(&executions)
        }
        Commands::Evaluations { policy_id, limit } => {
            let logs = deps.claims.evaluation_logs(policy_id, limit).await?;
            output(&logs)
        }
        Commands::Review { claim_id } => {
            let claim = deps
                .claim_lifecycle()
                .submit_for_review(claim_id, Utc::now())
                .await?;
            output(&claim)
        }
        Commands::Decide {
            claim_id,
            decision,
            by,
            notes,
        } => {
            let claim = deps
                .claim_lifecycle()
                .record_partner_decision(claim_id, &decision, &by, notes, Utc::now())
                .await?;
            output(&claim)
        }
        Commands::Pay { claim_id } => {
            let claim = deps.claim_lifecycle().mark_paid(claim_id, Utc::now()).await?;
            output(&claim)
        }
    }
}

async fn connect(config: &Config) -> Result<MonitorDeps> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let provider = HttpDataProvider::new(
        config.data_provider_base_url.clone(),
        config.data_provider_api_key.clone(),
        config.data_provider_timeout(),
    )?;

    Ok(MonitorDeps::postgres(pool, Arc::new(provider))
        .with_evaluator(config.evaluator_config())
        .with_claim_config(config.claim_config())
        .with_forwarding(config.forwarding()))
}

fn manager(config: &Config, deps: &MonitorDeps) -> Result<WorkerPoolManager> {
    Ok(WorkerPoolManager::new(
        deps.persistor.clone(),
        deps.job_registry()?,
        deps.policy_source(),
        config.worker_defaults(),
    ))
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_start(
    config: &Config,
    deps: &MonitorDeps,
    policy_id: PolicyId,
    run_secs: u64,
) -> Result<()> {
    let manager = manager(config, deps)?;
    let target = deps
        .policy_source()
        .monitor_target(policy_id)
        .await
        .with_context(|| format!("Failed to load monitoring plan for policy {}", policy_id))?;

    let handle = match manager.create_pool(target).await {
        Ok(_) => manager.start_pool(policy_id).await?,
        // Rows from an earlier run: start them as they are
        Err(WorkerError::PoolAlreadyExists(_)) => manager.start_pool(policy_id).await?,
        Err(e) => return Err(e.into()),
    };
    output(&json!({ "success": true, "pool": handle }))?;

    if run_secs > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(run_secs)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        manager.shutdown().await;
        if let Some(status) = manager.pool_status(policy_id).await? {
            output(&status)?;
        }
    }
    Ok(())
}
