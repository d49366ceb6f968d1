use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use reqwest::StatusCode;
use serde_json::json;

use crate::http::server::AppState;

/// Joins (or starts) a global refresh, then serves the resulting top view.
#[axum::debug_handler]
pub async fn get_servers_live(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.engine.refresh_now().await;

    match state.engine.cache().top_k() {
        Some(snapshot) => (StatusCode::OK, Json(snapshot.to_json())).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "No servers available or all tests failed."})),
        )
            .into_response(),
    }
}
