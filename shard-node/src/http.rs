use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use shard_rebalancer::{RebalanceCoordinator, ShardAssignment};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

pub type AppState = Arc<RebalanceCoordinator>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Cluster(#[from] shard_rebalancer::Error),
}

impl From<shard_rebalancer::NotReady> for ApiError {
    fn from(reason: shard_rebalancer::NotReady) -> Self {
        Self::Cluster(reason.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Cluster(e) = &self;
        let (status, reason) = match e {
            shard_rebalancer::Error::NotReady(reason) => {
                (StatusCode::SERVICE_UNAVAILABLE, reason.to_string())
            }
            other => {
                tracing::error!("Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        };

        let body = Json(json!({
            "reason": reason
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Only nodes that own a shard take traffic
async fn ready_check(State(coordinator): State<AppState>) -> ApiResult<&'static str> {
    coordinator.ready().await?;
    Ok("Ready check OK!")
}

/// The last committed table, `{}` while a rebalance is underway
async fn shards(State(coordinator): State<AppState>) -> Json<ShardAssignment> {
    Json(coordinator.assignment())
}

async fn status(State(coordinator): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "node_id": coordinator.node_id(),
        "shard": coordinator.local_shard(),
        "leader": coordinator.is_leader(),
        "rebalancing": coordinator.is_rebalancing(),
        "rebalances_started": coordinator.rebalances_started(),
    }))
}

pub fn router(coordinator: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/shards", get(shards))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}
