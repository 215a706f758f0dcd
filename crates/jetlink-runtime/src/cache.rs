//! Caching layer for jetlink-runtime.
//!
//! One [`CacheManager`] per data domain, each a bounded LRU store with
//! stale-while-revalidate semantics. [`MultiTierCacheManager`] keeps them
//! by domain name and runs the periodic sweep.

use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use jetlink_core::{CacheEntry, CachePolicy, Freshness};

const LATENCY_SAMPLES: usize = 100;

/// Per-call overrides for [`CacheManager::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub version: Option<u32>,
    pub metadata: BTreeMap<String, JsonValue>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }
}

/// A cache hit.
#[derive(Debug, Clone)]
pub struct CacheHit<T> {
    pub entry: Arc<CacheEntry<T>>,

    /// Past ttl but inside the stale window
    pub stale: bool,
}

impl<T: Clone> CacheHit<T> {
    pub fn data(&self) -> T {
        self.entry.data.clone()
    }
}

/// Counters for one cache domain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub entries: u64,
    pub evictions: u64,

    /// Percent of lookups that hit
    pub hit_rate: f64,

    /// Moving average over the last 100 lookups
    pub average_lookup_us: f64,
}

#[derive(Default)]
struct LookupStats {
    hits: u64,
    misses: u64,
    stale_hits: u64,
    latencies: VecDeque<Duration>,
}

impl LookupStats {
    fn record(&mut self, elapsed: Duration) {
        if self.latencies.len() == LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        self.latencies.push_back(elapsed);
    }
}

/// Expires entries at `ttl + stale_window`, per entry.
struct StaleWindowExpiry {
    stale_window: Duration,
}

impl<T> Expiry<String, Arc<CacheEntry<T>>> for StaleWindowExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry<T>>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.hard_expiry(self.stale_window))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<CacheEntry<T>>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.hard_expiry(self.stale_window))
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

/// Bounded key/value store for one data domain.
pub struct CacheManager<T> {
    domain: String,
    policy: CachePolicy,
    cache: Cache<String, Arc<CacheEntry<T>>>,
    stats: Mutex<LookupStats>,
    evictions: Arc<AtomicU64>,
}

impl<T> CacheManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(domain: impl Into<String>, policy: CachePolicy) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&evictions);

        let cache = Cache::builder()
            .max_capacity(policy.max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(StaleWindowExpiry {
                stale_window: policy.stale_window,
            })
            .eviction_listener(move |_key, _value, cause| {
                if cause == RemovalCause::Size {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        Self {
            domain: domain.into(),
            policy,
            cache,
            stats: Mutex::new(LookupStats::default()),
            evictions,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Look up `key`.
    ///
    /// Stale entries are returned flagged; refreshing them is the caller's
    /// decision. Entries past the stale window are evicted and count as a miss.
    pub async fn get(&self, key: &str) -> Option<CacheHit<T>> {
        let started = Instant::now();
        let found = self.cache.get(key).await;

        let outcome = match found {
            None => None,
            Some(entry) => match entry.freshness(now(), self.policy.stale_window) {
                Freshness::Fresh => Some(CacheHit { entry, stale: false }),
                Freshness::Stale => Some(CacheHit { entry, stale: true }),
                Freshness::Expired => {
                    self.cache.invalidate(key).await;
                    None
                }
            },
        };

        let mut stats = self.stats.lock();
        match &outcome {
            Some(hit) => {
                stats.hits += 1;
                if hit.stale {
                    stats.stale_hits += 1;
                }
            }
            None => stats.misses += 1,
        }
        stats.record(started.elapsed());
        drop(stats);

        tracing::trace!(
            domain = %self.domain,
            key = %key,
            hit = outcome.is_some(),
            stale = outcome.as_ref().map_or(false, |h| h.stale),
            "Cache lookup"
        );
        outcome
    }

    /// Store a new entry, replacing any previous one for `key`.
    pub async fn set(&self, key: impl Into<String>, data: T, source: &str, options: SetOptions) {
        let ttl = options.ttl.unwrap_or(self.policy.ttl);
        let entry = CacheEntry::new(data, source, ttl, now())
            .with_version(options.version.unwrap_or(1))
            .with_metadata(options.metadata);
        self.cache.insert(key.into(), Arc::new(entry)).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Drop every entry past its stale window. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let at = now();
        let expired: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.freshness(at, self.policy.stale_window) == Freshness::Expired)
            .map(|(key, _)| key)
            .collect();

        for key in &expired {
            self.cache.invalidate(key.as_str()).await;
        }
        self.cache.run_pending_tasks().await;

        if !expired.is_empty() {
            tracing::debug!(domain = %self.domain, purged = expired.len(), "Cache sweep");
        }
        expired.len()
    }

    pub async fn metrics(&self) -> CacheMetrics {
        self.cache.run_pending_tasks().await;
        let entries = self.cache.entry_count();

        let stats = self.stats.lock();
        let lookups = stats.hits + stats.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            stats.hits as f64 / lookups as f64 * 100.0
        };
        let average_lookup_us = if stats.latencies.is_empty() {
            0.0
        } else {
            stats
                .latencies
                .iter()
                .map(|d| d.as_secs_f64() * 1_000_000.0)
                .sum::<f64>()
                / stats.latencies.len() as f64
        };

        CacheMetrics {
            hits: stats.hits,
            misses: stats.misses,
            stale_hits: stats.stale_hits,
            entries,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate,
            average_lookup_us,
        }
    }
}

/// Registry of per-domain caches holding JSON values.
#[derive(Default)]
pub struct MultiTierCacheManager {
    domains: RwLock<BTreeMap<String, Arc<CacheManager<JsonValue>>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MultiTierCacheManager {
    /// Empty registry. Domains are created on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the given domain policies.
    pub fn with_policies(policies: BTreeMap<String, CachePolicy>) -> Self {
        let manager = Self::new();
        for (domain, policy) in policies {
            manager.register(&domain, policy);
        }
        manager
    }

    /// Registry with every built-in domain.
    pub fn with_builtin_domains() -> Self {
        let policies = CachePolicy::builtin_domains()
            .iter()
            .filter_map(|d| CachePolicy::for_domain(d).map(|p| (d.to_string(), p)))
            .collect();
        Self::with_policies(policies)
    }

    /// Register or replace a domain.
    pub fn register(&self, domain: &str, policy: CachePolicy) -> Arc<CacheManager<JsonValue>> {
        let cache = Arc::new(CacheManager::new(domain, policy));
        self.domains
            .write()
            .insert(domain.to_string(), Arc::clone(&cache));
        cache
    }

    pub fn get(&self, domain: &str) -> Option<Arc<CacheManager<JsonValue>>> {
        self.domains.read().get(domain).cloned()
    }

    /// Get a domain, creating it with its built-in or the default policy.
    pub fn domain(&self, domain: &str) -> Arc<CacheManager<JsonValue>> {
        if let Some(cache) = self.get(domain) {
            return cache;
        }
        let mut domains = self.domains.write();
        Arc::clone(domains.entry(domain.to_string()).or_insert_with(|| {
            let policy = CachePolicy::for_domain(domain).unwrap_or_default();
            Arc::new(CacheManager::new(domain, policy))
        }))
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.domains.read().keys().cloned().collect()
    }

    pub async fn all_metrics(&self) -> BTreeMap<String, CacheMetrics> {
        let mut metrics = BTreeMap::new();
        for cache in self.snapshot() {
            metrics.insert(cache.domain().to_string(), cache.metrics().await);
        }
        metrics
    }

    /// Sweep every domain. Returns the total number of purged entries.
    pub async fn sweep_all(&self) -> usize {
        let mut purged = 0;
        for cache in self.snapshot() {
            purged += cache.sweep().await;
        }
        purged
    }

    pub fn clear_all(&self) {
        for cache in self.snapshot() {
            cache.clear();
        }
    }

    /// Start the periodic sweep. Replaces any running sweeper.
    ///
    /// The task holds only a weak reference and exits once the registry is dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep_all().await;
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    fn snapshot(&self) -> Vec<Arc<CacheManager<JsonValue>>> {
        self.domains.read().values().cloned().collect()
    }
}

impl Drop for MultiTierCacheManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> CachePolicy {
        CachePolicy::new(Duration::from_secs(60), Duration::from_secs(30), 100)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_then_stale_then_gone() {
        let cache: CacheManager<JsonValue> = CacheManager::new("test", policy());
        cache.set("k", json!({"v": 1}), "test", SetOptions::default()).await;

        let hit = cache.get("k").await.unwrap();
        assert!(!hit.stale);
        assert_eq!(hit.data(), json!({"v": 1}));

        tokio::time::advance(Duration::from_secs(60)).await;
        let hit = cache.get("k").await.unwrap();
        assert!(hit.stale);
        assert_eq!(hit.data(), json!({"v": 1}));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.get("k").await.is_none());

        let metrics = cache.metrics().await;
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.stale_hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate - 200.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_miss_is_recorded() {
        let cache: CacheManager<String> = CacheManager::new("test", policy());
        assert!(cache.get("absent").await.is_none());
        assert_eq!(cache.metrics().await.misses, 1);
        assert_eq!(cache.metrics().await.hit_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_ttl_override() {
        let cache: CacheManager<u32> = CacheManager::new("test", policy());
        cache.set("short", 1, "test", SetOptions::ttl(Duration::from_secs(5))).await;
        cache.set("default", 2, "test", SetOptions::default()).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("short").await.unwrap().stale);
        assert!(!cache.get("default").await.unwrap().stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replaces_entry() {
        let cache: CacheManager<u32> = CacheManager::new("test", policy());
        cache.set("k", 1, "first", SetOptions::default()).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("k").await.unwrap().stale);

        let options = SetOptions {
            version: Some(2),
            ..Default::default()
        };
        cache.set("k", 2, "second", options).await;
        let hit = cache.get("k").await.unwrap();
        assert!(!hit.stale);
        assert_eq!(hit.data(), 2);
        assert_eq!(hit.entry.source, "second");
        assert_eq!(hit.entry.version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_expired_across_domains() {
        let registry = MultiTierCacheManager::with_builtin_domains();
        registry
            .domain("avinode-aircraft")
            .set("a", json!(1), "avinode", SetOptions::default())
            .await;
        registry
            .domain("apollo-leads")
            .set("l", json!(2), "apollo", SetOptions::default())
            .await;

        // Past avinode's 3m + 1m, inside apollo's 15m
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        assert_eq!(registry.sweep_all().await, 1);
        assert!(registry.domain("apollo-leads").get("l").await.is_some());
    }

    #[tokio::test]
    async fn test_registry_creates_domains_on_demand() {
        let registry = MultiTierCacheManager::new();
        assert!(registry.get("apollo-leads").is_none());

        let leads = registry.domain("apollo-leads");
        assert_eq!(leads.policy().ttl, Duration::from_secs(900));
        let custom = registry.domain("custom");
        assert_eq!(custom.policy(), &CachePolicy::default());
        assert_eq!(registry.domain_names().len(), 2);
    }

    #[tokio::test]
    async fn test_metrics_per_domain() {
        let registry = MultiTierCacheManager::with_builtin_domains();
        registry
            .domain("n8n-responses")
            .set("q", json!("answer"), "n8n", SetOptions::default())
            .await;
        registry.domain("n8n-responses").get("q").await;

        let metrics = registry.all_metrics().await;
        assert_eq!(metrics["n8n-responses"].hits, 1);
        assert_eq!(metrics["n8n-responses"].entries, 1);
        assert_eq!(metrics["apollo-leads"].hits, 0);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache: CacheManager<u32> = CacheManager::new("test", policy());
        cache.set("a", 1, "t", SetOptions::default()).await;
        cache.set("b", 2, "t", SetOptions::default()).await;

        cache.invalidate("a").await;
        assert!(cache.get("a").await.is_none());

        cache.clear();
        assert!(cache.get("b").await.is_none());
    }
}
