// src/handlers/health.rs
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use super::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store: String,
    pub push_enabled: bool,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthResponse>> {
    let store = if state.config.redis_url.is_some() { "redis" } else { "memory" };
    Json(ApiResponse::ok(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: store.to_string(),
        push_enabled: state.config.fcm_server_key.is_some() || state.config.push_mock,
    }))
}
