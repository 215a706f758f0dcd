//! Avinode aircraft availability API.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use jetlink_core::{IntegrationError, ServiceDomain, ServiceHealth};

use super::credentials::ApiCredential;
use super::http::{cached_post, PartnerHttp, PartnerReply};
use super::{DirectClient, DirectResponse};
use crate::cache::{CacheManager, MultiTierCacheManager};
use crate::config::PartnerConfig;
use crate::resilience::{CircuitBreaker, CircuitBreakerManager};

pub const AVINODE_API_KEY_ENV: &str = "AVINODE_API_KEY";

const SERVICE: &str = "avinode";
const CACHE_DOMAIN: &str = "avinode-aircraft";
const SEARCH_ENDPOINT: &str = "aircraft/search";

const CATEGORIES: &[&str] = &["turboprop", "light", "super-midsize", "midsize", "heavy", "ultra-long-range"];

lazy_static! {
    static ref PASSENGERS: Regex =
        Regex::new(r"(?i)\b(\d{1,3})\s*(?:passengers?|pax|people|guests)\b").unwrap();

    /// ICAO airport code
    static ref AIRPORT: Regex = Regex::new(r"\b[A-Z]{4}\b").unwrap();
}

/// Avinode aircraft-search parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AircraftSearch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_airport: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_airport: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passengers: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl AircraftSearch {
    /// Derive search parameters from a free-text request.
    ///
    /// The first two ICAO codes are read as departure and arrival.
    pub fn from_query(query: &str) -> Self {
        let mut airports = AIRPORT.find_iter(query).map(|m| m.as_str().to_string());
        let lower = query.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .collect();

        Self {
            departure_airport: airports.next(),
            arrival_airport: airports.next(),
            passengers: PASSENGERS
                .captures(query)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok()),
            category: CATEGORIES
                .iter()
                .find(|c| words.contains(*c))
                .map(|c| c.to_string()),
        }
    }
}

fn summarize(data: &JsonValue) -> String {
    let aircraft = data["aircraft"].as_array().map(Vec::as_slice).unwrap_or_default();
    if aircraft.is_empty() {
        return "No available aircraft found in Avinode.".to_string();
    }

    let mut lines = vec![format!("Found {} available aircraft in Avinode:", aircraft.len())];
    for item in aircraft {
        let model = item["model"].as_str().unwrap_or("Unknown aircraft");
        let mut line = format!("- {}", model);
        if let Some(category) = item["category"].as_str() {
            line.push_str(&format!(" ({})", category));
        }
        if let Some(seats) = item["seats"].as_u64() {
            line.push_str(&format!(", {} seats", seats));
        }
        if let Some(operator) = item["operator"].as_str() {
            line.push_str(&format!(", operated by {}", operator));
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub struct AvinodeClient {
    http: PartnerHttp,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<CacheManager<JsonValue>>,
}

impl AvinodeClient {
    /// Build from config. The API key comes from config or `AVINODE_API_KEY`.
    pub fn new(
        config: &PartnerConfig,
        breakers: &CircuitBreakerManager,
        caches: &MultiTierCacheManager,
    ) -> Result<Self, IntegrationError> {
        let credential = ApiCredential::from_config_or_env(
            config.api_key.as_deref(),
            AVINODE_API_KEY_ENV,
            "Avinode API key",
        )
        .ok();
        Ok(Self {
            http: PartnerHttp::new(SERVICE, config, credential)?,
            breaker: breakers.get(SERVICE),
            cache: caches.domain(CACHE_DOMAIN),
        })
    }

    pub async fn search_aircraft(
        &self,
        search: &AircraftSearch,
    ) -> Result<PartnerReply, IntegrationError> {
        let params = serde_json::to_value(search).map_err(|e| IntegrationError::Parse {
            service: SERVICE.to_string(),
            message: e.to_string(),
        })?;
        cached_post(&self.http, &self.breaker, &self.cache, SEARCH_ENDPOINT, &params).await
    }
}

#[async_trait]
impl DirectClient for AvinodeClient {
    fn name(&self) -> &str {
        SERVICE
    }

    fn domain(&self) -> ServiceDomain {
        ServiceDomain::Avinode
    }

    async fn execute(&self, query: &str) -> Result<DirectResponse, IntegrationError> {
        let search = AircraftSearch::from_query(query);
        tracing::debug!(service = SERVICE, search = ?search, "Searching aircraft");

        let reply = self.search_aircraft(&search).await?;
        Ok(DirectResponse {
            service: SERVICE.to_string(),
            summary: summarize(&reply.data),
            data: reply.data,
            cached: reply.cached,
            stale: reply.stale,
        })
    }

    fn health(&self) -> ServiceHealth {
        self.breaker.health()
    }
}
