//! API Module
//!
//! Small HTTP surface for health checks and operators. Not the job submission API.

pub mod health;

use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::pool::WorkerPool;

#[derive(Clone)]
pub struct AppState {
    pub consumer_id: Arc<str>,
    pub pool: WorkerPool,
}

/// Create the router for the health endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/status", get(health::status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
