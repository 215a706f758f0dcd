//! Cache entries, per-domain policies and deterministic key generation.
//!
//! Storage lives in `jetlink-runtime`; this module only decides how old an
//! entry is allowed to get and how keys are derived.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// How usable a cached entry is at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// `age < ttl`
    Fresh,

    /// `ttl <= age < ttl + stale_window`, servable but flagged
    Stale,

    /// `age >= ttl + stale_window`, must be evicted
    Expired,
}

/// A single cached value.
///
/// Entries are immutable once created. Refreshing a key replaces the entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,

    /// Wall-clock creation time, for reporting
    pub timestamp: DateTime<Utc>,

    /// Monotonic creation time, used for all age calculations
    pub inserted_at: Instant,

    pub ttl: Duration,

    /// Which tier or source produced the value
    pub source: String,

    pub version: u32,

    pub metadata: BTreeMap<String, JsonValue>,
}

impl<T> CacheEntry<T> {
    /// Create an entry stamped at `now`.
    pub fn new(data: T, source: impl Into<String>, ttl: Duration, now: Instant) -> Self {
        Self {
            data,
            timestamp: Utc::now(),
            inserted_at: now,
            ttl,
            source: source.into(),
            version: 1,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, JsonValue>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted_at)
    }

    /// Classify the entry against its own ttl and the domain stale window.
    pub fn freshness(&self, now: Instant, stale_window: Duration) -> Freshness {
        let age = self.age(now);
        if age < self.ttl {
            Freshness::Fresh
        } else if age < self.ttl + stale_window {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Total lifetime including the stale window.
    pub fn hard_expiry(&self, stale_window: Duration) -> Duration {
        self.ttl + stale_window
    }
}

/// Freshness policy for one data domain.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub stale_window: Duration,
    pub max_entries: u64,
}

impl CachePolicy {
    pub fn new(ttl: Duration, stale_window: Duration, max_entries: u64) -> Self {
        Self {
            ttl,
            stale_window,
            max_entries,
        }
    }

    /// Built-in policy for a known domain, if any.
    ///
    /// Aircraft availability changes faster than lead data, hence the
    /// shorter windows.
    pub fn for_domain(domain: &str) -> Option<Self> {
        let minutes = |m: u64| Duration::from_secs(m * 60);
        let policy = match domain {
            "apollo-leads" => Self::new(minutes(15), minutes(5), 1000),
            "apollo-campaigns" => Self::new(minutes(10), minutes(5), 500),
            "avinode-aircraft" => Self::new(minutes(3), minutes(1), 500),
            "avinode-trips" => Self::new(minutes(5), minutes(2), 500),
            "n8n-responses" => Self::new(minutes(5), minutes(10), 1000),
            _ => return None,
        };
        Some(policy)
    }

    /// Names of every built-in domain.
    pub fn builtin_domains() -> &'static [&'static str] {
        &[
            "apollo-leads",
            "apollo-campaigns",
            "avinode-aircraft",
            "avinode-trips",
            "n8n-responses",
        ]
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), Duration::from_secs(60), 1000)
    }
}

/// Deterministic key for a parameterised query.
///
/// Parameter names are sorted, rendered as `name=value` and joined with
/// `&`, then base64url encoded. String values are used verbatim; anything
/// else is rendered as JSON. Non-object `params` are rendered whole.
pub fn generate_key(prefix: &str, params: &JsonValue) -> String {
    let canonical = match params {
        JsonValue::Object(map) => {
            let mut pairs: Vec<(&String, &JsonValue)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            pairs
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, render_param(v)))
                .collect::<Vec<_>>()
                .join("&")
        }
        other => render_param(other),
    };

    format!("{}:{}", prefix, URL_SAFE_NO_PAD.encode(canonical.as_bytes()))
}

fn render_param(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fallback-cache key for a free-text query: base64 of the query itself.
pub fn query_key(query: &str) -> String {
    STANDARD.encode(query.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_freshness_windows() {
        let start = Instant::now();
        let entry = CacheEntry::new("v", "test", Duration::from_secs(10), start);
        let stale = Duration::from_secs(5);

        assert_eq!(entry.freshness(start, stale), Freshness::Fresh);
        assert_eq!(entry.freshness(start + Duration::from_secs(9), stale), Freshness::Fresh);
        assert_eq!(entry.freshness(start + Duration::from_secs(10), stale), Freshness::Stale);
        assert_eq!(entry.freshness(start + Duration::from_secs(14), stale), Freshness::Stale);
        assert_eq!(entry.freshness(start + Duration::from_secs(15), stale), Freshness::Expired);
    }

    #[test]
    fn test_generate_key_order_independent() {
        let a = generate_key("p", &json!({"a": 1, "b": 2}));
        let b = generate_key("p", &json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
        assert!(a.starts_with("p:"));
    }

    #[test]
    fn test_generate_key_distinguishes_values() {
        let a = generate_key("leads", &json!({"title": "CEO"}));
        let b = generate_key("leads", &json!({"title": "CFO"}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_query_key_is_base64() {
        assert_eq!(query_key("hi"), "aGk=");
    }

    #[test]
    fn test_builtin_policies() {
        let leads = CachePolicy::for_domain("apollo-leads").unwrap();
        let aircraft = CachePolicy::for_domain("avinode-aircraft").unwrap();
        assert_eq!(leads.ttl, Duration::from_secs(900));
        assert!(aircraft.ttl < leads.ttl);
        assert!(CachePolicy::for_domain("unknown").is_none());
    }

    proptest! {
        #[test]
        fn prop_key_ignores_insertion_order(
            params in proptest::collection::btree_map("[a-z]{1,6}", 0i64..1000, 0..8)
        ) {
            let forward: serde_json::Map<String, JsonValue> = params
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let reversed: serde_json::Map<String, JsonValue> = params
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();

            prop_assert_eq!(
                generate_key("p", &JsonValue::Object(forward)),
                generate_key("p", &JsonValue::Object(reversed))
            );
        }
    }
}
