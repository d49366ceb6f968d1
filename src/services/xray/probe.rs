use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tracing::{debug, warn};

use crate::common::parsers::Server;
use crate::services::xray::config::XrayTestConfig;
use crate::services::xray::ports::PortAllocator;
use crate::utils::config::Settings;

const READY_WAIT_CEILING: Duration = Duration::from_secs(2);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE: Duration = Duration::from_secs(2);
const ENGINE_STARTUP_RETRIES: usize = 2;
const TAIL_LINES: usize = 32;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("engine failed to become ready")]
    EngineStartup,

    #[error("no free local port")]
    PortExhausted,

    #[error("transport failure during probe")]
    ProbeNetwork,

    #[error("probe returned http {0}")]
    ProbeHttp(u16),

    #[error("probe deadline exceeded")]
    Timeout,

    #[error("latency {0}ms above cutoff")]
    TooSlow(u32),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub server: Arc<Server>,
    pub probe_url: String,
    pub outcome: Result<u32, ProbeError>,
    pub measured_at: SystemTime,
}

impl ProbeResult {
    pub fn failed(server: Arc<Server>, probe_url: &str, error: ProbeError) -> Self {
        ProbeResult {
            server,
            probe_url: probe_url.to_string(),
            outcome: Err(error),
            measured_at: SystemTime::now(),
        }
    }

    pub fn latency_ms(&self) -> Option<u32> {
        self.outcome.as_ref().ok().copied()
    }
}

/// Seam between the scheduler and the engine-backed runner so the dispatch
/// layer can be exercised without spawning processes.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, server: Arc<Server>, probe_url: &str) -> ProbeResult;
}

/// Runs one server through a dedicated engine process: synthesize config,
/// spawn, wait for the SOCKS inbound, measure a proxied HEAD, tear down.
/// Teardown runs on every exit path so no process, port, or scratch dir
/// outlives the job.
pub struct ProbeRunner {
    xray_path: PathBuf,
    xray_assets_path: PathBuf,
    test_timeout: Duration,
    max_delay_ms: u32,
    ports: Arc<PortAllocator>,
}

impl ProbeRunner {
    pub fn new(settings: &Settings, ports: Arc<PortAllocator>) -> Self {
        ProbeRunner {
            xray_path: settings.xray_path.clone(),
            xray_assets_path: settings.xray_assets_path.clone(),
            test_timeout: settings.test_timeout,
            max_delay_ms: settings.max_delay_ms,
            ports,
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    async fn run_attempt(
        &self,
        server: &Server,
        port: u16,
        probe_url: &str,
        deadline: Instant,
    ) -> Result<u32, ProbeError> {
        let scratch = tempfile::tempdir().map_err(|err| {
            warn!(%err, "failed to create probe scratch dir");
            ProbeError::EngineStartup
        })?;

        let config_path = scratch.path().join("config.json");
        let document = XrayTestConfig::for_server(server, port);
        let bytes = serde_json::to_vec(&document).map_err(|err| {
            warn!(%err, "failed to serialize engine config");
            ProbeError::EngineStartup
        })?;
        tokio::fs::write(&config_path, bytes).await.map_err(|err| {
            warn!(%err, "failed to write engine config");
            ProbeError::EngineStartup
        })?;

        let mut command = Command::new(&self.xray_path);
        command
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.xray_assets_path.is_dir() {
            command.env("XRAY_LOCATION_ASSET", &self.xray_assets_path);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                debug!(%err, path = %self.xray_path.display(), "engine spawn failed");
                return Err(ProbeError::EngineStartup);
            }
        };

        let tail = EngineTail::attach(&mut child);
        let outcome = self.drive(&mut child, port, probe_url, deadline).await;
        self.teardown(&mut child).await;

        if matches!(outcome, Err(ProbeError::EngineStartup)) {
            for line in tail.dump() {
                debug!(engine = %line, address = server.address(), "engine output");
            }
        }

        outcome
    }

    async fn drive(
        &self,
        child: &mut Child,
        port: u16,
        probe_url: &str,
        deadline: Instant,
    ) -> Result<u32, ProbeError> {
        let ready_deadline = deadline.min(Instant::now() + READY_WAIT_CEILING);

        loop {
            if let Ok(Some(_)) = child.try_wait() {
                return Err(ProbeError::EngineStartup);
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break;
            }
            if Instant::now() >= ready_deadline {
                return Err(if Instant::now() >= deadline {
                    ProbeError::Timeout
                } else {
                    ProbeError::EngineStartup
                });
            }
            sleep(READY_POLL_INTERVAL).await;
        }

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(ProbeError::Timeout)?;

        let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{port}"))
            .map_err(|_| ProbeError::ProbeNetwork)?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(remaining)
            .build()
            .map_err(|_| ProbeError::ProbeNetwork)?;

        let started = Instant::now();
        let response = match timeout(remaining, client.head(probe_url).send()).await {
            Err(_) => return Err(ProbeError::Timeout),
            Ok(Err(err)) if err.is_timeout() => return Err(ProbeError::Timeout),
            Ok(Err(_)) => return Err(ProbeError::ProbeNetwork),
            Ok(Ok(response)) => response,
        };
        let latency_ms = started.elapsed().as_millis() as u32;

        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(ProbeError::ProbeHttp(status.as_u16()));
        }
        if latency_ms > self.max_delay_ms {
            return Err(ProbeError::TooSlow(latency_ms));
        }

        Ok(latency_ms)
    }

    /// Polite terminate, short grace, then hard kill. Always reaps.
    async fn teardown(&self, child: &mut Child) {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        if timeout(TERM_GRACE, child.wait()).await.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl Prober for ProbeRunner {
    async fn probe(&self, server: Arc<Server>, probe_url: &str) -> ProbeResult {
        let deadline = Instant::now() + self.test_timeout;
        let mut attempt = 0;

        let outcome = loop {
            let Some(port) = self.ports.allocate() else {
                break Err(ProbeError::PortExhausted);
            };

            let result = self.run_attempt(&server, port, probe_url, deadline).await;
            self.ports.release(port);

            match result {
                Err(ProbeError::EngineStartup)
                    if attempt < ENGINE_STARTUP_RETRIES && Instant::now() < deadline =>
                {
                    attempt += 1;
                    continue;
                }
                other => break other,
            }
        };

        ProbeResult {
            server,
            probe_url: probe_url.to_string(),
            outcome,
            measured_at: SystemTime::now(),
        }
    }
}

/// Bounded tail of the engine's merged stdout/stderr, kept for diagnostics.
struct EngineTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl EngineTail {
    fn attach(child: &mut Child) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));

        let handle = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => {
                let stdout = LinesStream::new(BufReader::new(stdout).lines());
                let stderr = LinesStream::new(BufReader::new(stderr).lines());
                let mut merged = stdout.merge(stderr);
                let sink = Arc::clone(&lines);

                tokio::spawn(async move {
                    while let Some(Ok(line)) = merged.next().await {
                        let mut buffer = sink.lock().unwrap();
                        if buffer.len() == TAIL_LINES {
                            buffer.pop_front();
                        }
                        buffer.push_back(line);
                    }
                })
            }
            _ => tokio::spawn(async {}),
        };

        EngineTail { lines, handle }
    }

    fn dump(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

impl Drop for EngineTail {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::parsers::parse_uri;
    use crate::utils::config::{GithubSettings, Settings};

    fn test_settings() -> Settings {
        Settings {
            sub_urls: vec![],
            xray_path: PathBuf::from("/nonexistent/raysift-test-xray"),
            xray_assets_path: PathBuf::from("/nonexistent/assets"),
            probe_url: crate::DEFAULT_PROBE_URL.to_string(),
            precheck_sites: vec![],
            cache_interval: Duration::from_secs(900),
            site_cache_ttl: Duration::from_secs(3600),
            test_timeout: Duration::from_secs(2),
            max_delay_ms: 8000,
            max_concurrent: 4,
            batch_size: 100,
            low_internet_cons: false,
            low_internet_limit: 50,
            port_range: 22100..22200,
            http_host: "127.0.0.1".to_string(),
            http_port: 0,
            github: GithubSettings {
                enabled: false,
                repo_url: String::new(),
                token: String::new(),
                user: String::new(),
                email: String::new(),
                branch: "main".to_string(),
                filename: "subscription.txt".to_string(),
                repo_dir: PathBuf::from("/tmp/raysift-mirror"),
            },
        }
    }

    #[tokio::test]
    async fn missing_engine_binary_is_engine_startup_and_leaks_no_ports() {
        let settings = test_settings();
        let ports = Arc::new(PortAllocator::new(settings.port_range.clone()));
        let runner = ProbeRunner::new(&settings, Arc::clone(&ports));

        let server = Arc::new(parse_uri("vless://uuid@1.2.3.4:443?type=tcp#t").unwrap());
        let result = runner.probe(server, "http://www.google.com/generate_204").await;

        assert_eq!(result.outcome, Err(ProbeError::EngineStartup));
        assert_eq!(ports.in_use(), 0);
    }
}
