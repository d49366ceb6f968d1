use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Json, Router};
use reqwest::Method;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::http::handlers::{
    cache::{get_all_base64, get_cached, get_cached_base64, get_cached_raw},
    servers::get_servers_live,
    subscription::get_site_specific,
};
use crate::services::refresh::RefreshEngine;
use crate::utils::config::Settings;

pub struct AppState {
    pub engine: Arc<RefreshEngine>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub fn router(engine: Arc<RefreshEngine>) -> Router {
    let state = Arc::new(AppState { engine });

    let cors_layer = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/servers/live", get(get_servers_live))
        .route("/cache", get(get_cached))
        .route("/cache/raw", get(get_cached_raw))
        .route("/cache/base64", get(get_cached_base64))
        .route("/cache/all/base64", get(get_all_base64))
        .route("/subscription/site-specific", get(get_site_specific))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(cors_layer))
}

pub async fn serve(engine: Arc<RefreshEngine>, settings: &Settings) -> anyhow::Result<()> {
    let addr = format!("{}:{}", settings.http_host, settings.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "http server listening");

    let app = router(Arc::clone(&engine));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine))
        .await
        .context("http server failed")
}

async fn shutdown_signal(engine: Arc<RefreshEngine>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    engine.shutdown();
}
