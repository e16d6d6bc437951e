//! Queue API Handlers
//!
//! Introspection and administration of the execution queue.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use comet_core::domain::job::{JobState, QueuedJob};
use comet_core::dto::queue::QueueStats;
use comet_engine::Engine;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CleanRequest {
    pub grace_ms: u64,
    pub state: JobState,
}

/// GET /queue/stats
pub async fn get_stats(State(engine): State<Arc<Engine>>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(engine.queue().stats().await?))
}

/// GET /queue/failed?limit=
pub async fn list_failed(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<QueuedJob>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(engine.queue().failed_jobs(limit).await?))
}

/// GET /queue/jobs/{id}
pub async fn get_job(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<QueuedJob>> {
    let job = engine
        .queue()
        .status(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))?;

    Ok(Json(job))
}

/// POST /queue/jobs/{id}/retry
/// Only failed jobs can be retried
pub async fn retry_job(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    tracing::info!("Retrying job: {}", id);

    if !engine.queue().retry_failed(id).await? {
        return Err(ApiError::BadRequest(format!("Job {} is not a failed job", id)));
    }
    Ok(Json(json!({ "retried": true })))
}

/// POST /queue/pause
pub async fn pause(State(engine): State<Arc<Engine>>) -> ApiResult<Json<Value>> {
    engine.queue().pause().await?;
    Ok(Json(json!({ "paused": true })))
}

/// POST /queue/resume
pub async fn resume(State(engine): State<Arc<Engine>>) -> ApiResult<Json<Value>> {
    engine.queue().resume().await?;
    Ok(Json(json!({ "paused": false })))
}

/// POST /queue/clean
pub async fn clean(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CleanRequest>,
) -> ApiResult<Json<Value>> {
    let removed = engine
        .queue()
        .clean(Duration::from_millis(req.grace_ms), req.state)
        .await?;

    Ok(Json(json!({ "removed": removed })))
}
