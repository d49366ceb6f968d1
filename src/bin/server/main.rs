use std::sync::Arc;

use mimalloc::MiMalloc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use raysift::http;
use raysift::services::mirror::GitMirror;
use raysift::services::refresh::{RefreshEngine, RefreshHook};
use raysift::services::xray::ports::PortAllocator;
use raysift::services::xray::probe::{ProbeRunner, Prober};
use raysift::utils::config::Settings;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    if !settings.xray_path.exists() {
        warn!(
            path = %settings.xray_path.display(),
            "xray executable not found; probes will fail until it is installed"
        );
    }

    let ports = Arc::new(PortAllocator::new(settings.port_range.clone()));
    let prober: Arc<dyn Prober> = Arc::new(ProbeRunner::new(&settings, ports));

    let mut hooks: Vec<Arc<dyn RefreshHook>> = Vec::new();
    if settings.github.enabled
        && !settings.github.repo_url.is_empty()
        && !settings.github.token.is_empty()
    {
        hooks.push(Arc::new(GitMirror::new(settings.github.clone())));
    }

    let engine = RefreshEngine::new(settings.clone(), prober, hooks);
    tokio::spawn(Arc::clone(&engine).run());

    http::server::serve(engine, &settings).await
}
