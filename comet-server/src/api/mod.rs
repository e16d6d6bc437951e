//! API Module
//!
//! Administrative HTTP surface of the execution engine.

pub mod error;
pub mod health;
pub mod queue;
pub mod runs;

use axum::{
    Router,
    routing::{get, post},
};
use comet_engine::Engine;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the main API router with all endpoints
pub fn create_router(engine: Arc<Engine>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Run endpoints
        .route("/runs", post(runs::submit_run))
        .route("/runs/{id}", get(runs::get_run))
        .route("/runs/{id}/cancel", post(runs::cancel_run))
        // Queue endpoints
        .route("/queue/stats", get(queue::get_stats))
        .route("/queue/failed", get(queue::list_failed))
        .route("/queue/jobs/{id}", get(queue::get_job))
        .route("/queue/jobs/{id}/retry", post(queue::retry_job))
        .route("/queue/pause", post(queue::pause))
        .route("/queue/resume", post(queue::resume))
        .route("/queue/clean", post(queue::clean))
        // Add state and middleware
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
}
