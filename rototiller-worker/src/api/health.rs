//! Health and status handlers

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use super::AppState;

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub consumer: String,
    pub capacity: usize,
    pub in_flight: usize,
    pub peak: usize,
}

/// GET /status
/// Worker pool occupancy
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        consumer: state.consumer_id.to_string(),
        capacity: state.pool.capacity(),
        in_flight: state.pool.in_flight(),
        peak: state.pool.peak(),
    })
}
