use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use reqwest::StatusCode;
use serde_json::json;

use crate::http::server::AppState;

pub(crate) fn cold_start() -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": "Cache not initialized. Please wait or try the /servers/live endpoint."
        })),
    )
        .into_response()
}

#[axum::debug_handler]
pub async fn get_cached(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.cache().top_k() {
        Some(snapshot) => (StatusCode::OK, Json(snapshot.to_json())).into_response(),
        None => cold_start(),
    }
}

#[axum::debug_handler]
pub async fn get_cached_raw(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.cache().top_k() {
        Some(snapshot) => (StatusCode::OK, snapshot.to_raw()).into_response(),
        None => cold_start(),
    }
}

#[axum::debug_handler]
pub async fn get_cached_base64(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.cache().top_k() {
        Some(snapshot) => (StatusCode::OK, snapshot.to_base64()).into_response(),
        None => cold_start(),
    }
}

#[axum::debug_handler]
pub async fn get_all_base64(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.cache().all_working() {
        Some(snapshot) => (StatusCode::OK, snapshot.to_base64()).into_response(),
        None => cold_start(),
    }
}
