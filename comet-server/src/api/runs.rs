//! Run API Handlers
//!
//! Submission, inspection and cancellation of pipeline runs.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use comet_core::domain::job::QueuedJob;
use comet_core::domain::run::PipelineRun;
use comet_core::domain::stage::StageRun;
use comet_core::dto::execution::ExecutionRequest;
use comet_core::dto::queue::JobOptions;
use comet_engine::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct SubmitRun {
    #[serde(flatten)]
    pub request: ExecutionRequest,
    #[serde(default)]
    pub options: Option<JobOptions>,
}

#[derive(Serialize)]
pub struct RunDetails {
    run: PipelineRun,
    stages: Vec<StageRun>,
}

/// POST /runs
/// Create the pending run and enqueue it; re-submitting a run id is a no-op
pub async fn submit_run(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SubmitRun>,
) -> ApiResult<(StatusCode, Json<QueuedJob>)> {
    tracing::info!(
        "Submitting run {} for pipeline {}",
        req.request.pipeline_run_id,
        req.request.pipeline_id
    );

    let enqueued = engine.submit(req.request, req.options).await?;
    let status = if enqueued.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(enqueued.job)))
}

/// GET /runs/{id}
pub async fn get_run(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RunDetails>> {
    tracing::debug!("Getting run: {}", id);

    let (run, stages) = engine
        .run_details(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;

    Ok(Json(RunDetails { run, stages }))
}

/// POST /runs/{id}/cancel
pub async fn cancel_run(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    tracing::info!("Cancelling run: {}", id);

    let cancelled = engine.cancel_run(id).await?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}
