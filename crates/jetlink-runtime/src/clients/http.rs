//! Shared HTTP plumbing for the partner APIs.

use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use jetlink_core::{generate_key, IntegrationError};

use super::credentials::ApiCredential;
use crate::cache::{CacheManager, SetOptions};
use crate::config::PartnerConfig;
use crate::resilience::{retry_transient, CircuitBreaker, RetryPolicy};

/// Longest upstream error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

/// Map a transport error to the integration taxonomy.
pub(crate) fn map_reqwest_error(service: &str, timeout: Duration, err: reqwest::Error) -> IntegrationError {
    if err.is_timeout() {
        IntegrationError::Timeout {
            service: service.to_string(),
            timeout,
        }
    } else if err.is_decode() {
        IntegrationError::Parse {
            service: service.to_string(),
            message: err.to_string(),
        }
    } else {
        IntegrationError::TransientNetwork {
            service: service.to_string(),
            message: err.to_string(),
        }
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// JSON-over-HTTP client for one partner, with bearer auth, request spacing
/// and transient-failure retry.
pub struct PartnerHttp {
    service: &'static str,
    client: reqwest::Client,
    base_url: String,
    credential: Option<ApiCredential>,
    timeout: Duration,
    min_interval: Duration,
    retry: RetryPolicy,

    /// When the last request was sent; held while waiting so calls queue up
    last_request: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for PartnerHttp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartnerHttp")
            .field("service", &self.service)
            .field("base_url", &self.base_url)
            .field("credential", &self.credential)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PartnerHttp {
    pub fn new(
        service: &'static str,
        config: &PartnerConfig,
        credential: Option<ApiCredential>,
    ) -> Result<Self, IntegrationError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IntegrationError::NotConfigured(format!("{} HTTP client: {}", service, e)))?;

        if credential.is_none() {
            tracing::warn!(service = %service, "No API key configured; requests are sent unauthenticated");
        }

        Ok(Self {
            service,
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credential,
            timeout: config.timeout,
            min_interval: config.min_request_interval,
            retry: config.retry.clone(),
            last_request: Mutex::new(None),
        })
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Wait until `min_interval` has passed since the previous request.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let ready = at + self.min_interval;
            if Instant::now() < ready {
                tokio::time::sleep_until(ready).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// POST `body` to `<base_url>/<endpoint>`, retrying transient failures.
    pub async fn post_json(&self, endpoint: &str, body: &JsonValue) -> Result<JsonValue, IntegrationError> {
        retry_transient(&self.retry, self.service, || self.send_once(endpoint, body)).await
    }

    async fn send_once(&self, endpoint: &str, body: &JsonValue) -> Result<JsonValue, IntegrationError> {
        self.pace().await;

        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        let mut request = self.client.post(&url).timeout(self.timeout).json(body);
        if let Some(credential) = &self.credential {
            request = request.bearer_auth(credential.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(self.service, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(IntegrationError::UpstreamRejected {
                service: self.service.to_string(),
                status: status.as_u16(),
                message: truncate_body(&text),
            });
        }

        response
            .json::<JsonValue>()
            .await
            .map_err(|e| IntegrationError::Parse {
                service: self.service.to_string(),
                message: e.to_string(),
            })
    }
}

/// Result of a cache-aside partner call.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerReply {
    pub data: JsonValue,

    /// Served from the partner cache instead of a live call
    pub cached: bool,

    /// Served from cache past its ttl because the refresh failed
    pub stale: bool,
}

/// Cache-aside partner call.
///
/// Fresh cache hits skip the upstream. Stale hits are refreshed through the
/// breaker and served, flagged stale, if the refresh fails. Failed calls
/// never touch the cache.
pub(crate) async fn cached_post(
    http: &PartnerHttp,
    breaker: &CircuitBreaker,
    cache: &CacheManager<JsonValue>,
    endpoint: &str,
    params: &JsonValue,
) -> Result<PartnerReply, IntegrationError> {
    let key = generate_key(endpoint, params);
    let cached = cache.get(&key).await;
    if let Some(hit) = &cached {
        if !hit.stale {
            return Ok(PartnerReply {
                data: hit.data(),
                cached: true,
                stale: false,
            });
        }
    }

    match breaker.execute(|| http.post_json(endpoint, params)).await {
        Ok(data) => {
            cache.set(key, data.clone(), http.service(), SetOptions::default()).await;
            Ok(PartnerReply {
                data,
                cached: false,
                stale: false,
            })
        }
        Err(e) => match cached {
            Some(hit) => {
                tracing::warn!(service = %http.service(), error = %e, "Refresh failed, serving stale entry");
                Ok(PartnerReply {
                    data: hit.data(),
                    cached: true,
                    stale: hit.stale,
                })
            }
            None => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::testing::reply_once;
    use crate::resilience::CircuitBreakerConfig;
    use jetlink_core::CachePolicy;
    use serde_json::json;

    fn local_config(interval: Duration) -> PartnerConfig {
        PartnerConfig {
            base_url: "http://127.0.0.1:1/api/".to_string(),
            api_key: None,
            timeout: Duration::from_secs(2),
            min_request_interval: interval,
            retry: RetryPolicy::none(),
        }
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("  short \n"), "short");
        let long = "x".repeat(500);
        let cut = truncate_body(&long);
        assert_eq!(cut.len(), MAX_ERROR_BODY + 3);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_base_url_normalized() {
        let http = PartnerHttp::new("apollo", &local_config(Duration::ZERO), None).unwrap();
        assert_eq!(http.base_url(), "http://127.0.0.1:1/api");
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_spaced() {
        let http = PartnerHttp::new("avinode", &local_config(Duration::from_millis(500)), None).unwrap();
        let started = Instant::now();
        http.pace().await;
        http.pace().await;
        http.pace().await;
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let http = PartnerHttp::new("apollo", &local_config(Duration::ZERO), None).unwrap();
        let err = http.post_json("search", &json!({})).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {:?}", err);
    }

    fn serving(base_url: String) -> PartnerHttp {
        let config = PartnerConfig {
            base_url,
            ..local_config(Duration::ZERO)
        };
        PartnerHttp::new("apollo", &config, None).unwrap()
    }

    fn lead_cache() -> CacheManager<JsonValue> {
        CacheManager::new("apollo-leads", CachePolicy::for_domain("apollo-leads").unwrap())
    }

    #[tokio::test]
    async fn test_error_status_is_upstream_rejected() {
        let http = serving(reply_once("401 Unauthorized", r#"{"error":"invalid api key"}"#).await);
        let err = http.post_json("mixed_people/search", &json!({})).await.unwrap_err();

        match err {
            IntegrationError::UpstreamRejected { status, message, .. } => {
                assert_eq!(status, 401);
                assert!(message.contains("invalid api key"));
            }
            other => panic!("expected UpstreamRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_json_body_is_parse_error() {
        let http = serving(reply_once("200 OK", "<html>maintenance</html>").await);
        let err = http.post_json("mixed_people/search", &json!({})).await.unwrap_err();
        assert!(matches!(err, IntegrationError::Parse { .. }), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_failed_call_never_writes_cache() {
        let http = serving(reply_once("500 Internal Server Error", "boom").await);
        let breaker = CircuitBreaker::new("apollo", CircuitBreakerConfig::for_service("apollo"));
        let cache = lead_cache();
        let params = json!({ "q_keywords": "aviation" });

        let err = cached_post(&http, &breaker, &cache, "mixed_people/search", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::UpstreamRejected { status: 500, .. }));
        assert!(cache.get(&generate_key("mixed_people/search", &params)).await.is_none());
        assert_eq!(breaker.health().total_failures, 1);
    }

    #[tokio::test]
    async fn test_live_answer_is_cached() {
        let http = serving(reply_once("200 OK", r#"{"people":[]}"#).await);
        let breaker = CircuitBreaker::new("apollo", CircuitBreakerConfig::for_service("apollo"));
        let cache = lead_cache();
        let params = json!({ "q_keywords": "aviation" });

        let live = cached_post(&http, &breaker, &cache, "mixed_people/search", &params).await.unwrap();
        assert_eq!(live.data, json!({ "people": [] }));
        assert!(!live.cached && !live.stale);

        // The responder is gone, so this can only come from the cache
        let again = cached_post(&http, &breaker, &cache, "mixed_people/search", &params).await.unwrap();
        assert!(again.cached);
        assert!(!again.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_flagged_when_refresh_fails() {
        let http = PartnerHttp::new("apollo", &local_config(Duration::ZERO), None).unwrap();
        let breaker = CircuitBreaker::new("apollo", CircuitBreakerConfig::for_service("apollo"));
        let cache = lead_cache();
        let params = json!({ "q_keywords": "charter" });
        cache
            .set(
                generate_key("mixed_people/search", &params),
                json!({ "people": [{ "name": "Ada" }] }),
                "apollo",
                SetOptions::ttl(Duration::from_secs(1)),
            )
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let reply = cached_post(&http, &breaker, &cache, "mixed_people/search", &params).await.unwrap();
        assert!(reply.cached);
        assert!(reply.stale);
        assert_eq!(reply.data["people"][0]["name"], "Ada");
        assert_eq!(breaker.health().total_failures, 1);
    }
}
