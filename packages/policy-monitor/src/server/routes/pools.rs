use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::common::PolicyId;
use crate::kernel::jobs::{PoolSnapshot, PoolStatus};
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct PoolsResponse {
    pools: Vec<PoolStatus>,
    ai_pool: PoolSnapshot,
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "failed to read worker pool state");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

/// `GET /monitoring/pools`
pub async fn pool_statuses_handler(Extension(state): Extension<AppState>) -> Response {
    match state.manager.pool_statuses().await {
        Ok(pools) => Json(PoolsResponse {
            pools,
            ai_pool: state.manager.ai_pool().snapshot(),
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /monitoring/pools/:policy_id`
pub async fn pool_status_handler(
    Extension(state): Extension<AppState>,
    Path(policy_id): Path<String>,
) -> Response {
    let Ok(policy_id) = PolicyId::parse(&policy_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid policy id {:?}", policy_id) })),
        )
            .into_response();
    };

    match state.manager.pool_status(policy_id).await {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no worker pool for policy {}", policy_id) })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}
