use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::http::server::AppState;

#[derive(Deserialize)]
pub struct SiteQuery {
    url: Option<String>,
}

/// Serves the cached site view for `url`, testing the working set against it
/// first when the entry is missing or expired.
#[axum::debug_handler]
pub async fn get_site_specific(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SiteQuery>,
) -> impl IntoResponse {
    let Some(site_url) = query.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing required query parameter: url"})),
        )
            .into_response();
    };

    if Url::parse(site_url).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Invalid url: {site_url}")})),
        )
            .into_response();
    }

    match state.engine.site_specific(site_url).await {
        Some(snapshot) => (StatusCode::OK, snapshot.to_base64()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Cache is empty. Please wait for it to populate."})),
        )
            .into_response(),
    }
}
