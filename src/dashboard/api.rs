//! Dashboard HTTP API
//!
//! JSON endpoints over the collector's read API.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::ApiResponse;
use crate::collector::CollectorService;
use crate::persistence::CycleRecord;

const MAX_LATEST_LIMIT: usize = 1000;

/// Create the API router with all endpoints
pub fn create_router(service: Arc<CollectorService>) -> Router {
    Router::new()
        .route("/api/latest", get(get_latest))
        .route("/api/count", get(get_count))
        .route("/api/status", get(get_status))
        .with_state(service)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    limit: Option<usize>,
}

/// GET /api/latest - Cached latest record, or the last N with ?limit=N
async fn get_latest(
    Query(query): Query<LatestQuery>,
    State(service): State<Arc<CollectorService>>,
) -> impl IntoResponse {
    let records: anyhow::Result<Vec<CycleRecord>> = match query.limit {
        Some(0) => {
            return Json(ApiResponse::<Vec<CycleRecord>>::error(
                "limit must be at least 1",
            ))
        }
        Some(limit) => service.get_latest(limit.min(MAX_LATEST_LIMIT)).await,
        None => service.latest().await.map(|r| r.into_iter().collect()),
    };

    match records {
        Ok(records) if records.is_empty() => Json(ApiResponse::error("no data")),
        Ok(records) => Json(ApiResponse::success(records)),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read latest records");
            Json(ApiResponse::error(e.to_string()))
        }
    }
}

/// GET /api/count - Number of persisted cycles
async fn get_count(State(service): State<Arc<CollectorService>>) -> impl IntoResponse {
    match service.get_count().await {
        Ok(count) => Json(ApiResponse::success(count)),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

/// GET /api/status - Running flag and heartbeat
async fn get_status(State(service): State<Arc<CollectorService>>) -> impl IntoResponse {
    Json(ApiResponse::success(service.get_status()))
}
