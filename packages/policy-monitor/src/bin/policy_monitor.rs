// Main entry point for the policy monitor service

use std::sync::Arc;

use anyhow::{Context, Result};
use policy_monitor_core::kernel::jobs::{RecoveryManager, WorkerPoolManager};
use policy_monitor_core::kernel::{start_scheduler, HttpDataProvider, MonitorDeps};
use policy_monitor_core::server::{build_app, AppState};
use policy_monitor_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,policy_monitor_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting policy monitor");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let provider = HttpDataProvider::new(
        config.data_provider_base_url.clone(),
        config.data_provider_api_key.clone(),
        config.data_provider_timeout(),
    )?;
    let deps = MonitorDeps::postgres(pool.clone(), Arc::new(provider))
        .with_evaluator(config.evaluator_config())
        .with_claim_config(config.claim_config())
        .with_forwarding(config.forwarding());

    let registry = deps.job_registry()?;
    let policies = deps.policy_source();
    let manager = WorkerPoolManager::new(
        deps.persistor.clone(),
        registry,
        policies.clone(),
        config.worker_defaults(),
    );

    // Recovery failures are per-policy and never stop startup
    let recovery = Arc::new(RecoveryManager::new(manager.clone(), policies));
    match recovery.recover_active_policies().await {
        Ok(report) => tracing::info!(
            total = report.total,
            recovered = report.recovered,
            failed = report.failed.len(),
            reconciled = report.reconciled,
            abandoned_jobs = report.abandoned_jobs,
            "recovery complete"
        ),
        Err(e) => tracing::warn!(error = %e, "recovery could not list active policies"),
    }

    let mut cron = start_scheduler(
        Arc::new(deps.claim_lifecycle()),
        &config.claim_sweep_cron,
        recovery,
        &config.policy_adopt_cron,
    )
    .await
    .context("Failed to start scheduled tasks")?;

    let app = build_app(AppState {
        db_pool: pool,
        manager: manager.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting status server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down worker pools...");
    manager.shutdown().await;
    if let Err(e) = cron.shutdown().await {
        tracing::warn!(error = %e, "cron scheduler did not shut down cleanly");
    }
    tracing::info!("Policy monitor stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("received shutdown signal");
}
