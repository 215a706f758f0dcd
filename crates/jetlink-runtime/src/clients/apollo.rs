//! Apollo lead-generation API.

use async_trait::async_trait;
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

pub const APOLLO_API_KEY_ENV: &str = "APOLLO_API_KEY";

const SERVICE: &str = "apollo";
const CACHE_DOMAIN: &str = "apollo-leads";
const SEARCH_ENDPOINT: &str = "mixed_people/search";

/// Titles recognised in free text, mapped to the filter value sent upstream.
const TITLES: &[(&str, &str)] = &[
    ("ceo", "CEO"),
    ("cfo", "CFO"),
    ("coo", "COO"),
    ("cto", "CTO"),
    ("founder", "Founder"),
    ("president", "President"),
    ("owner", "Owner"),
    ("director", "Director"),
    ("vp", "VP"),
    ("executive", "Executive"),
];

/// Words dropped when building the keyword filter.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "the", "for", "of", "in", "at", "to", "me", "find", "show", "get", "search",
    "list", "with", "apollo", "lead", "leads", "campaign", "campaigns",
];

/// Apollo people-search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSearch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub person_titles: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub q_keywords: String,

    pub page: u32,
    pub per_page: u32,
}

impl Default for LeadSearch {
    fn default() -> Self {
        Self {
            person_titles: Vec::new(),
            q_keywords: String::new(),
            page: 1,
            per_page: 10,
        }
    }
}

impl LeadSearch {
    /// Derive search parameters from a free-text request.
    pub fn from_query(query: &str) -> Self {
        let mut search = Self::default();
        let mut keywords = Vec::new();

        for word in query
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .filter(|w| !w.is_empty())
        {
            let lower = word.to_lowercase();
            let singular = lower.trim_end_matches('s');
            if let Some((_, title)) = TITLES.iter().find(|(k, _)| *k == lower || *k == singular) {
                if !search.person_titles.iter().any(|t| t == title) {
                    search.person_titles.push(title.to_string());
                }
            } else if !STOPWORDS.contains(&lower.as_str()) {
                keywords.push(word.to_string());
            }
        }

        search.q_keywords = keywords.join(" ");
        search
    }
}

/// Render a people-search response as a short list.
fn summarize(data: &JsonValue) -> String {
    let people = data["people"].as_array().map(Vec::as_slice).unwrap_or_default();
    if people.is_empty() {
        return "No matching leads found in Apollo.".to_string();
    }

    let mut lines = vec![format!("Found {} leads in Apollo:", people.len())];
    for person in people {
        let name = person["name"].as_str().unwrap_or("Unknown");
        let mut line = format!("- {}", name);
        if let Some(title) = person["title"].as_str() {
            line.push_str(&format!(", {}", title));
        }
        if let Some(org) = person["organization"]["name"].as_str() {
            line.push_str(&format!(" at {}", org));
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub struct ApolloClient {
    http: PartnerHttp,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<CacheManager<JsonValue>>,
}

impl ApolloClient {
    /// Build from config. The API key comes from config or `APOLLO_API_KEY`.
    pub fn new(
        config: &PartnerConfig,
        breakers: &CircuitBreakerManager,
        caches: &MultiTierCacheManager,
    ) -> Result<Self, IntegrationError> {
        let credential =
            ApiCredential::from_config_or_env(config.api_key.as_deref(), APOLLO_API_KEY_ENV, "Apollo API key")
                .ok();
        Ok(Self {
            http: PartnerHttp::new(SERVICE, config, credential)?,
            breaker: breakers.get(SERVICE),
            cache: caches.domain(CACHE_DOMAIN),
        })
    }

    /// Search people, answering from the lead cache when possible.
    pub async fn search_leads(&self, search: &LeadSearch) -> Result<PartnerReply, IntegrationError> {
        let params = serde_json::to_value(search).map_err(|e| IntegrationError::Parse {
            service: SERVICE.to_string(),
            message: e.to_string(),
        })?;
        cached_post(&self.http, &self.breaker, &self.cache, SEARCH_ENDPOINT, &params).await
    }
}

#[async_trait]
impl DirectClient for ApolloClient {
    fn name(&self) -> &str {
        SERVICE
    }

    fn domain(&self) -> ServiceDomain {
        ServiceDomain::Apollo
    }

    async fn execute(&self, query: &str) -> Result<DirectResponse, IntegrationError> {
        let search = LeadSearch::from_query(query);
        tracing::debug!(service = SERVICE, titles = ?search.person_titles, keywords = %search.q_keywords, "Searching leads");

        let reply = self.search_leads(&search).await?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_titles_and_keywords_extracted() {
        let search = LeadSearch::from_query("Find CEOs and founders in private aviation for a campaign");
        assert_eq!(search.person_titles, vec!["CEO", "Founder"]);
        assert_eq!(search.q_keywords, "private aviation");
        assert_eq!(search.page, 1);
        assert_eq!(search.per_page, 10);
    }

    #[test]
    fn test_search_serializes_without_empty_filters() {
        let params = serde_json::to_value(LeadSearch::from_query("apollo leads")).unwrap();
        assert_eq!(params, json!({"page": 1, "per_page": 10}));
    }

    #[test]
    fn test_summarize_people() {
        let data = json!({
            "people": [
                {"name": "Jane Doe", "title": "CEO", "organization": {"name": "Acme Air"}},
                {"name": "John Roe"}
            ]
        });
        assert_eq!(
            summarize(&data),
            "Found 2 leads in Apollo:\n- Jane Doe, CEO at Acme Air\n- John Roe"
        );
        assert_eq!(summarize(&json!({})), "No matching leads found in Apollo.");
    }

    #[test]
    fn test_client_uses_named_breaker_and_cache() {
        let breakers = CircuitBreakerManager::new();
        let caches = MultiTierCacheManager::new();
        let config = PartnerConfig {
            api_key: Some("test-key".to_string()),
            ..PartnerConfig::apollo()
        };
        let client = ApolloClient::new(&config, &breakers, &caches).unwrap();

        assert_eq!(client.health().service, "apollo");
        assert_eq!(breakers.get("apollo").config().failure_threshold, 3);
        assert!(caches.get("apollo-leads").is_some());
    }
}
