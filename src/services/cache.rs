use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use base64::{prelude::BASE64_STANDARD, Engine};
use serde::Serialize;

use crate::common::parsers::{Server, ServerKind};
use crate::TOP_K;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub server: Arc<Server>,
    pub latency_ms: u32,
}

/// Immutable, atomically published view of one refresh generation.
#[derive(Debug)]
pub struct CacheSnapshot {
    pub generation: u64,
    pub built_at: SystemTime,
    pub entries: Vec<CacheEntry>,
}

#[derive(Serialize)]
struct EntryBody<'a> {
    raw_uri: &'a str,
    kind: ServerKind,
    address: &'a str,
    port: u16,
    latency_ms: u32,
    tag: &'a str,
}

impl CacheSnapshot {
    fn build(generation: u64, mut entries: Vec<CacheEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.latency_ms
                .cmp(&b.latency_ms)
                .then_with(|| a.server.raw_uri().cmp(b.server.raw_uri()))
        });

        CacheSnapshot {
            generation,
            built_at: SystemTime::now(),
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let body: Vec<EntryBody<'_>> = self
            .entries
            .iter()
            .map(|entry| EntryBody {
                raw_uri: entry.server.raw_uri(),
                kind: entry.server.kind(),
                address: entry.server.address(),
                port: entry.server.port(),
                latency_ms: entry.latency_ms,
                tag: entry.server.tag(),
            })
            .collect();

        serde_json::to_value(body).expect("cache entries serialize")
    }

    pub fn to_raw(&self) -> String {
        self.entries
            .iter()
            .map(|entry| entry.server.raw_uri())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.to_raw())
    }
}

struct Published {
    top_k: Arc<CacheSnapshot>,
    all_working: Arc<CacheSnapshot>,
}

pub struct SiteEntry {
    pub snapshot: Arc<CacheSnapshot>,
    pub expires_at: Instant,
}

pub enum SiteLookup {
    Fresh(Arc<CacheSnapshot>),
    Stale(Arc<CacheSnapshot>),
    Miss,
}

/// Holds the ranked views. Both global views of one generation sit behind a
/// single lock and are replaced together, so readers can never observe
/// top-k and all-working from different generations.
pub struct ServerCache {
    published: RwLock<Option<Published>>,
    site: Mutex<HashMap<String, SiteEntry>>,
}

impl ServerCache {
    pub fn new() -> Self {
        ServerCache {
            published: RwLock::new(None),
            site: Mutex::new(HashMap::new()),
        }
    }

    /// Builds and swaps in both views for `generation`. The write guard is
    /// held only for the pointer swap.
    pub fn publish(&self, generation: u64, entries: Vec<CacheEntry>) -> Arc<CacheSnapshot> {
        let all_working = Arc::new(CacheSnapshot::build(generation, entries));
        let top_k = Arc::new(CacheSnapshot {
            generation,
            built_at: all_working.built_at,
            entries: all_working.entries.iter().take(TOP_K).cloned().collect(),
        });

        let published = Published {
            top_k,
            all_working: Arc::clone(&all_working),
        };
        *self.published.write().unwrap() = Some(published);

        all_working
    }

    pub fn top_k(&self) -> Option<Arc<CacheSnapshot>> {
        self.published
            .read()
            .unwrap()
            .as_ref()
            .map(|p| Arc::clone(&p.top_k))
    }

    pub fn all_working(&self) -> Option<Arc<CacheSnapshot>> {
        self.published
            .read()
            .unwrap()
            .as_ref()
            .map(|p| Arc::clone(&p.all_working))
    }

    pub fn generation(&self) -> Option<u64> {
        self.published
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p.all_working.generation)
    }

    pub fn site_lookup(&self, probe_url: &str) -> SiteLookup {
        let table = self.site.lock().unwrap();
        match table.get(probe_url) {
            Some(entry) if Instant::now() < entry.expires_at => {
                SiteLookup::Fresh(Arc::clone(&entry.snapshot))
            }
            Some(entry) => SiteLookup::Stale(Arc::clone(&entry.snapshot)),
            None => SiteLookup::Miss,
        }
    }

    pub fn site_store(&self, probe_url: &str, snapshot: Arc<CacheSnapshot>, ttl: Duration) {
        let entry = SiteEntry {
            snapshot,
            expires_at: Instant::now() + ttl,
        };
        self.site.lock().unwrap().insert(probe_url.to_string(), entry);
    }

    pub fn site_snapshots(&self) -> Vec<(String, Arc<CacheSnapshot>)> {
        self.site
            .lock()
            .unwrap()
            .iter()
            .map(|(url, entry)| (url.clone(), Arc::clone(&entry.snapshot)))
            .collect()
    }

    /// Assembles a sorted snapshot for site-specific results, reusing the
    /// generation of the base view the test ran against.
    pub fn snapshot_for(&self, generation: u64, entries: Vec<CacheEntry>) -> Arc<CacheSnapshot> {
        Arc::new(CacheSnapshot::build(generation, entries))
    }
}

impl Default for ServerCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::parsers::parse_uri;

    fn entry(uri: &str, latency_ms: u32) -> CacheEntry {
        CacheEntry {
            server: Arc::new(parse_uri(uri).unwrap()),
            latency_ms,
        }
    }

    fn entries(count: usize) -> Vec<CacheEntry> {
        (0..count)
            .map(|i| {
                entry(
                    &format!("vless://uuid@10.1.0.{}:2000?type=tcp#n{i}", i % 250),
                    (count - i) as u32 * 10,
                )
            })
            .collect()
    }

    #[test]
    fn snapshots_sort_by_latency_then_raw_uri() {
        let cache = ServerCache::new();
        let all = cache.publish(
            1,
            vec![
                entry("vless://uuid@b.example:443?type=tcp#b", 200),
                entry("vless://uuid@a.example:443?type=tcp#a", 200),
                entry("vless://uuid@c.example:443?type=tcp#c", 120),
            ],
        );

        let uris: Vec<&str> = all.entries.iter().map(|e| e.server.raw_uri()).collect();
        assert_eq!(
            uris,
            vec![
                "vless://uuid@c.example:443?type=tcp#c",
                "vless://uuid@a.example:443?type=tcp#a",
                "vless://uuid@b.example:443?type=tcp#b",
            ]
        );
    }

    #[test]
    fn top_k_is_bounded_prefix_of_all_working() {
        let cache = ServerCache::new();
        cache.publish(1, entries(40));

        let top = cache.top_k().unwrap();
        let all = cache.all_working().unwrap();
        assert_eq!(top.len(), TOP_K);
        assert_eq!(all.len(), 40);
        for (t, a) in top.entries.iter().zip(all.entries.iter()) {
            assert_eq!(t.server.raw_uri(), a.server.raw_uri());
        }
    }

    #[test]
    fn views_always_share_a_generation() {
        let cache = ServerCache::new();
        cache.publish(1, entries(3));
        cache.publish(2, entries(5));

        let top = cache.top_k().unwrap();
        let all = cache.all_working().unwrap();
        assert_eq!(top.generation, 2);
        assert_eq!(all.generation, 2);
        assert_eq!(cache.generation(), Some(2));
    }

    #[test]
    fn serializations_agree() {
        let cache = ServerCache::new();
        cache.publish(1, entries(4));
        let top = cache.top_k().unwrap();

        let decoded = BASE64_STANDARD.decode(top.to_base64()).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), top.to_raw());

        let json = top.to_json();
        let body = json.as_array().unwrap();
        assert_eq!(body.len(), 4);
        assert_eq!(body[0]["kind"], "vless");
        assert_eq!(body[0]["latency_ms"], 10);
    }

    #[test]
    fn site_table_expires() {
        let cache = ServerCache::new();
        let snapshot = cache.snapshot_for(1, entries(2));
        cache.site_store("https://youtube.com", Arc::clone(&snapshot), Duration::ZERO);

        match cache.site_lookup("https://youtube.com") {
            SiteLookup::Stale(stale) => assert_eq!(stale.len(), 2),
            _ => panic!("expected stale entry"),
        }
        assert!(matches!(
            cache.site_lookup("https://example.net"),
            SiteLookup::Miss
        ));
    }
}
