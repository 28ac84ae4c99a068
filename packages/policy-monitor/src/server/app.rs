//! Status server setup.

use axum::{extract::Extension, routing::get, Router};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::kernel::jobs::WorkerPoolManager;
use crate::server::routes::{health_handler, pool_status_handler, pool_statuses_handler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub manager: WorkerPoolManager,
}

/// Read-only status surface: health plus worker pool state.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/monitoring/pools", get(pool_statuses_handler))
        .route("/monitoring/pools/:policy_id", get(pool_status_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}
