use std::time::Duration;

use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::kernel::jobs::PoolSnapshot;
use crate::server::app::AppState;

const DB_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
pub struct HealthResponse {
    healthy: bool,
    database: DatabaseHealth,
    policy_pools: usize,
    ai_pool: PoolSnapshot,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    reachable: bool,
    connections: u32,
    idle: usize,
    max_connections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn check_database(state: &AppState) -> DatabaseHealth {
    let error = match tokio::time::timeout(
        DB_CHECK_TIMEOUT,
        sqlx::query("SELECT 1").execute(&state.db_pool),
    )
    .await
    {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("no answer within {:?}", DB_CHECK_TIMEOUT)),
    };

    DatabaseHealth {
        reachable: error.is_none(),
        connections: state.db_pool.size(),
        idle: state.db_pool.num_idle(),
        max_connections: state.db_pool.options().get_max_connections(),
        error,
    }
}

/// `GET /health`
///
/// 503 when Postgres does not answer. Worker pools keep retrying on their
/// own, so pool state is reported but never fails the check.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = check_database(&state).await;
    let healthy = database.reachable;

    let body = HealthResponse {
        healthy,
        database,
        policy_pools: state.manager.running_policy_ids().len(),
        ai_pool: state.manager.ai_pool().snapshot(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
