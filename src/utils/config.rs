use std::env;
use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{DEFAULT_PROBE_URL, DEFAULT_SUB_URL, DEFAULT_XRAY_ASSETS_PATH, DEFAULT_XRAY_PATH};

/// Runtime configuration, resolved once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub sub_urls: Vec<String>,
    pub xray_path: PathBuf,
    pub xray_assets_path: PathBuf,

    pub probe_url: String,
    pub precheck_sites: Vec<String>,

    pub cache_interval: Duration,
    pub site_cache_ttl: Duration,
    pub test_timeout: Duration,
    pub max_delay_ms: u32,

    pub max_concurrent: usize,
    pub batch_size: usize,
    pub low_internet_cons: bool,
    pub low_internet_limit: usize,

    pub port_range: Range<u16>,

    pub http_host: String,
    pub http_port: u16,

    pub github: GithubSettings,
}

#[derive(Debug, Clone)]
pub struct GithubSettings {
    pub enabled: bool,
    pub repo_url: String,
    pub token: String,
    pub user: String,
    pub email: String,
    pub branch: String,
    pub filename: String,
    pub repo_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        let sub_urls = env_list("SUB_URLS")
            .or_else(|| env_list("SUB_URL"))
            .unwrap_or_else(|| vec![DEFAULT_SUB_URL.to_string()]);

        Settings {
            sub_urls,
            xray_path: PathBuf::from(env_string("XRAY_PATH", DEFAULT_XRAY_PATH)),
            xray_assets_path: PathBuf::from(env_string(
                "XRAY_ASSETS_PATH",
                DEFAULT_XRAY_ASSETS_PATH,
            )),
            probe_url: env_string("PROBE_URL", DEFAULT_PROBE_URL),
            precheck_sites: env_list("PRECHECK_SITES").unwrap_or_default(),
            cache_interval: Duration::from_secs(env_parse("CACHE_INTERVAL_SECONDS", 900u64)),
            site_cache_ttl: Duration::from_secs(env_parse("SITE_CACHE_TTL_SECONDS", 3600u64)),
            test_timeout: Duration::from_secs(env_parse("TEST_TIMEOUT", 10u64)),
            max_delay_ms: env_parse("MAX_DELAY_MS", 8000u32),
            max_concurrent: env_parse("MAX_CONCURRENT", 50usize).max(1),
            batch_size: env_parse("BATCH_SIZE", 500usize).max(1),
            low_internet_cons: env_bool("LOW_INTERNET_CONS", false),
            low_internet_limit: env_parse("LOW_INTERNET_LIMIT", 50usize),
            port_range: env_parse("PORT_RANGE_START", 20000u16)..env_parse("PORT_RANGE_END", 30000u16),
            http_host: env_string("HTTP_HOST", "0.0.0.0"),
            http_port: env_parse("HTTP_PORT", 8084u16),
            github: GithubSettings {
                enabled: env_bool("GITHUB_PUSH_ENABLED", false),
                repo_url: env_string("GITHUB_REPO_URL", ""),
                token: env_string("GITHUB_TOKEN", ""),
                user: env_string("GITHUB_USER", "raysift-bot"),
                email: env_string("GITHUB_EMAIL", "bot@example.com"),
                branch: env_string("GITHUB_BRANCH", "main"),
                filename: env_string("GITHUB_FILENAME", "subscription.txt"),
                repo_dir: PathBuf::from(env_string("GITHUB_REPO_DIR", "/app/subscription_repo")),
            },
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    if items.is_empty() { None } else { Some(items) }
}
