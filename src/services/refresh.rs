use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::common::fetchers::subscription::SubscriptionFetcher;
use crate::common::parsers::Server;
use crate::services::cache::{CacheEntry, CacheSnapshot, ServerCache, SiteLookup};
use crate::services::scheduler::ProbeScheduler;
use crate::services::xray::probe::Prober;
use crate::utils::config::Settings;

/// Invoked after a snapshot swap, outside every lock. Failures are the
/// hook's own problem and never affect publication.
#[async_trait]
pub trait RefreshHook: Send + Sync {
    async fn on_refresh(&self, all_working: &CacheSnapshot);

    async fn on_site(&self, site_url: &str, snapshot: &CacheSnapshot);
}

type RefreshFlight = Shared<BoxFuture<'static, Option<u64>>>;
type SiteFlight = Shared<BoxFuture<'static, Option<Arc<CacheSnapshot>>>>;

/// Long-running orchestrator: fetch, parse, dedupe, probe, swap. Periodic
/// ticks and on-demand callers funnel into one in-flight refresh at a time;
/// site-specific tests singleflight per probe URL.
pub struct RefreshEngine {
    settings: Settings,
    fetcher: SubscriptionFetcher,
    prober: Arc<dyn Prober>,
    cache: Arc<ServerCache>,
    generation: AtomicU64,
    refresh_flight: Mutex<Option<RefreshFlight>>,
    site_flights: Mutex<HashMap<String, SiteFlight>>,
    hooks: Vec<Arc<dyn RefreshHook>>,
    cancel: CancellationToken,
}

impl RefreshEngine {
    pub fn new(
        settings: Settings,
        prober: Arc<dyn Prober>,
        hooks: Vec<Arc<dyn RefreshHook>>,
    ) -> Arc<Self> {
        Arc::new(RefreshEngine {
            settings,
            fetcher: SubscriptionFetcher::new(),
            prober,
            cache: Arc::new(ServerCache::new()),
            generation: AtomicU64::new(0),
            refresh_flight: Mutex::new(None),
            site_flights: Mutex::new(HashMap::new()),
            hooks,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cache(&self) -> Arc<ServerCache> {
        Arc::clone(&self.cache)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Periodic driver. The first tick fires immediately, so startup also
    /// populates the cache.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.cache_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("refresh loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh_now().await;
                }
            }
        }
    }

    /// Joins the in-flight refresh if one is running, otherwise starts one.
    /// Returns the published generation, or None for a degraded cycle.
    pub async fn refresh_now(self: &Arc<Self>) -> Option<u64> {
        let flight = {
            let mut guard = self.refresh_flight.lock().unwrap();
            match guard.as_ref() {
                Some(flight) => flight.clone(),
                None => {
                    let engine = Arc::clone(self);
                    let flight: RefreshFlight = async move {
                        let outcome = engine.refresh_once().await;
                        engine.refresh_flight.lock().unwrap().take();
                        outcome
                    }
                    .boxed()
                    .shared();
                    *guard = Some(flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    async fn refresh_once(self: &Arc<Self>) -> Option<u64> {
        if self.cancel.is_cancelled() {
            return None;
        }

        info!("refresh started");
        let fetched = self.fetcher.fetch_servers(&self.settings.sub_urls).await;
        let total = fetched.len();

        let mut seen = HashSet::new();
        let mut servers: Vec<Arc<Server>> = Vec::new();
        for server in fetched {
            if seen.insert(server.raw_uri().to_string()) {
                servers.push(Arc::new(server));
            }
        }
        info!(total, unique = servers.len(), "subscription sources fetched");

        if self.settings.low_internet_cons && servers.len() > self.settings.low_internet_limit {
            info!(
                limit = self.settings.low_internet_limit,
                "low bandwidth mode, truncating test set"
            );
            servers.truncate(self.settings.low_internet_limit);
        }

        if servers.is_empty() {
            warn!("degraded refresh: no servers fetched, keeping previous snapshot");
            return None;
        }

        let scheduler = self.scheduler();
        let results = scheduler.run(&servers, &self.settings.probe_url).await;

        let entries: Vec<CacheEntry> = results
            .into_iter()
            .filter_map(|result| {
                result.latency_ms().map(|latency_ms| CacheEntry {
                    server: result.server,
                    latency_ms,
                })
            })
            .collect();

        if entries.is_empty() {
            warn!(
                previous = self.cache.generation(),
                "degraded refresh: zero successful probes, keeping previous snapshot"
            );
            return None;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let all_working = self.cache.publish(generation, entries);
        info!(generation, working = all_working.len(), "cache updated");

        self.precheck_sites().await;

        // Hooks run after the swap, outside every lock, and see the fresh
        // working set plus whatever site views are currently cached.
        for hook in &self.hooks {
            hook.on_refresh(&all_working).await;
        }
        for (site_url, snapshot) in self.cache.site_snapshots() {
            if snapshot.is_empty() {
                continue;
            }
            for hook in &self.hooks {
                hook.on_site(&site_url, &snapshot).await;
            }
        }

        Some(generation)
    }

    async fn precheck_sites(self: &Arc<Self>) {
        for site_url in &self.settings.precheck_sites {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.site_refresh(site_url).await {
                Some(snapshot) if snapshot.is_empty() => info!(%site_url, "no server reaches site"),
                Some(_) => {}
                None => warn!(%site_url, "site precheck skipped: no base snapshot"),
            }
        }
    }

    /// Serves from the site table within its TTL; otherwise runs (or joins)
    /// a test pass for that URL. None means there is no base snapshot yet.
    pub async fn site_specific(self: &Arc<Self>, site_url: &str) -> Option<Arc<CacheSnapshot>> {
        match self.cache.site_lookup(site_url) {
            SiteLookup::Fresh(snapshot) => Some(snapshot),
            SiteLookup::Stale(_) | SiteLookup::Miss => self.site_refresh(site_url).await,
        }
    }

    async fn site_refresh(self: &Arc<Self>, site_url: &str) -> Option<Arc<CacheSnapshot>> {
        let flight = {
            let mut flights = self.site_flights.lock().unwrap();
            match flights.get(site_url) {
                Some(flight) => flight.clone(),
                None => {
                    let engine = Arc::clone(self);
                    let url = site_url.to_string();
                    let flight: SiteFlight = async move {
                        let outcome = engine.test_site(&url).await;
                        engine.site_flights.lock().unwrap().remove(&url);
                        outcome
                    }
                    .boxed()
                    .shared();
                    flights.insert(site_url.to_string(), flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    async fn test_site(&self, site_url: &str) -> Option<Arc<CacheSnapshot>> {
        let base = self.cache.all_working()?;
        let servers: Vec<Arc<Server>> = base
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.server))
            .collect();

        info!(site_url, servers = servers.len(), "testing site-specific access");
        let results = self.scheduler().run(&servers, site_url).await;

        let entries: Vec<CacheEntry> = results
            .into_iter()
            .filter_map(|result| {
                result.latency_ms().map(|latency_ms| CacheEntry {
                    server: result.server,
                    latency_ms,
                })
            })
            .collect();

        let snapshot = self.cache.snapshot_for(base.generation, entries);
        self.cache
            .site_store(site_url, Arc::clone(&snapshot), self.settings.site_cache_ttl);
        info!(site_url, working = snapshot.len(), "site cache updated");

        Some(snapshot)
    }

    fn scheduler(&self) -> ProbeScheduler {
        ProbeScheduler::new(
            Arc::clone(&self.prober),
            self.settings.max_concurrent,
            self.settings.batch_size,
            self.cancel.child_token(),
        )
    }
}
