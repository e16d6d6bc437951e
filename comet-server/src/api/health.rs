//! Health Check API Handler

use axum::{Json, extract::State};
use comet_engine::Engine;
use serde::Serialize;
use std::sync::Arc;

use crate::api::error::ApiResult;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    status: &'static str,
    runtime_available: bool,
    queue_paused: bool,
    active_runs: usize,
}

/// GET /health
pub async fn health_check(State(engine): State<Arc<Engine>>) -> ApiResult<Json<Health>> {
    Ok(Json(Health {
        status: "ok",
        runtime_available: engine.executor().runtime_available().await,
        queue_paused: engine.queue().is_paused().await?,
        active_runs: engine.orchestrator().active_runs().len(),
    }))
}
