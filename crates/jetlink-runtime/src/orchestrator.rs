//! Fallback-ordered request orchestration.
//!
//! Every request walks PRIMARY -> DIRECT -> CACHE -> ERROR and stops at the
//! first tier that answers. Tiers are tried strictly in sequence. Public
//! entry points never fail: when nothing answers, the caller gets a
//! status-only response describing each tier.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use jetlink_core::{
    query_key, CircuitBreakerMetrics, IntegrationError, IntegrationResponse, OverallHealth,
    ResponseSource, ServiceDomain, ServiceHealth, TierStatus,
};

use crate::cache::{CacheMetrics, MultiTierCacheManager, SetOptions};
use crate::clients::{DirectClient, PrimaryRequest, PrimaryService};
use crate::config::OrchestratorConfig;
use crate::logger::{new_request_id, IntegrationLogger};
use crate::resilience::CircuitBreakerManager;

const COMPONENT: &str = "orchestrator";
const RESPONSE_TIME_SAMPLES: usize = 100;

/// Cancels every request carrying the paired [`CancellationSignal`].
#[derive(Debug)]
pub struct CancellationHandle {
    tx: watch::Sender<bool>,
}

impl CancellationHandle {
    pub fn channel() -> (Self, CancellationSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancellationSignal { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `operation` unless `signal` fires first.
async fn with_cancellation<T, Fut>(
    signal: Option<&CancellationSignal>,
    operation: Fut,
) -> Result<T, IntegrationError>
where
    Fut: Future<Output = Result<T, IntegrationError>>,
{
    match signal {
        None => operation.await,
        Some(signal) => {
            tokio::select! {
                biased;
                _ = signal.cancelled() => Err(IntegrationError::Cancelled),
                result = operation => result,
            }
        }
    }
}

/// A caller request.
#[derive(Debug, Clone)]
pub struct IntegrationRequest {
    pub query: String,
    pub session_id: Option<String>,
    pub cancel: Option<CancellationSignal>,
}

impl IntegrationRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: None,
            cancel: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cancellation(mut self, signal: CancellationSignal) -> Self {
        self.cancel = Some(signal);
        self
    }
}

/// Item of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamChunk {
    Text(String),

    /// Always the last item
    Done(StreamSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub request_id: String,
    pub source: ResponseSource,
    pub stale: bool,
    pub response_time_ms: u64,
}

impl From<&IntegrationResponse> for StreamSummary {
    fn from(response: &IntegrationResponse) -> Self {
        Self {
            request_id: response.request_id.clone(),
            source: response.source,
            stale: response.stale,
            response_time_ms: response.response_time_ms,
        }
    }
}

/// Cumulative orchestrator counters.
#[derive(Debug, Clone, Serialize)]
pub struct ResilientProviderMetrics {
    pub total_requests: u64,
    pub n8n_requests: u64,
    pub direct_api_requests: u64,
    pub cache_hits: u64,
    pub fallback_activations: u64,

    /// Moving average over the last 100 requests
    pub average_response_time_ms: f64,

    /// Percent of requests answered by any tier other than status-only
    pub success_rate: f64,

    pub last_health_check: Option<DateTime<Utc>>,
    pub overall_health: Option<OverallHealth>,
}

impl Default for ResilientProviderMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            n8n_requests: 0,
            direct_api_requests: 0,
            cache_hits: 0,
            fallback_activations: 0,
            average_response_time_ms: 0.0,
            success_rate: 100.0,
            last_health_check: None,
            overall_health: None,
        }
    }
}

/// Point-in-time view of the whole integration layer.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub overall_health: OverallHealth,
    pub tiers: Vec<TierStatus>,
    pub breakers: Vec<ServiceHealth>,
    pub breaker_metrics: BTreeMap<String, CircuitBreakerMetrics>,
    pub caches: BTreeMap<String, CacheMetrics>,
    pub metrics: ResilientProviderMetrics,
}

#[derive(Default)]
struct OrchestratorState {
    metrics: ResilientProviderMetrics,
    response_times: VecDeque<u64>,

    /// Most recent error per tier name
    last_errors: BTreeMap<String, String>,
}

/// Routes requests through the fallback tiers.
pub struct ResilientOrchestrator {
    primary: Arc<dyn PrimaryService>,
    direct: Vec<Arc<dyn DirectClient>>,
    breakers: Arc<CircuitBreakerManager>,
    caches: Arc<MultiTierCacheManager>,
    logger: Arc<IntegrationLogger>,
    config: OrchestratorConfig,
    state: Mutex<OrchestratorState>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientOrchestrator {
    pub fn builder() -> ResilientOrchestratorBuilder {
        ResilientOrchestratorBuilder::default()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn caches(&self) -> &Arc<MultiTierCacheManager> {
        &self.caches
    }

    pub fn logger(&self) -> &Arc<IntegrationLogger> {
        &self.logger
    }

    /// Answer a request from the first tier that can.
    pub async fn generate(&self, request: IntegrationRequest) -> IntegrationResponse {
        let request_id = new_request_id();
        let started = Instant::now();
        let domain = ServiceDomain::classify(&request.query);
        self.logger.info(
            COMPONENT,
            "request.received",
            Some(&request_id),
            json!({ "domain": domain, "query_length": request.query.len() }),
        );

        let mut response = self.run_tiers(&request_id, &request, domain).await;
        response.response_time_ms = started.elapsed().as_millis() as u64;
        response.metadata.insert("domain".to_string(), json!(domain));
        self.record_response(&response);

        let completed = json!({
            "source": response.source,
            "stale": response.stale,
            "authoritative": response.source.is_authoritative(),
            "response_time_ms": response.response_time_ms,
        });
        if response.is_degraded() {
            self.logger
                .warn(COMPONENT, "request.completed", Some(&request_id), completed);
        } else {
            self.logger
                .info(COMPONENT, "request.completed", Some(&request_id), completed);
        }
        response
    }

    /// Answer a request as a finite stream of text fragments and one summary.
    ///
    /// Fragments are paced by `stream_chunk_delay`. Dropping the stream stops
    /// the producer.
    pub fn stream(self: &Arc<Self>, request: IntegrationRequest) -> ReceiverStream<StreamChunk> {
        let (tx, rx) = mpsc::channel(1);
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            let response = orchestrator.generate(request).await;
            let words = orchestrator.config.stream_chunk_words.max(1);
            let delay = orchestrator.config.stream_chunk_delay;

            let tokens: Vec<&str> = response.content.split_inclusive(char::is_whitespace).collect();
            for (i, fragment) in tokens.chunks(words).enumerate() {
                if i > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(StreamChunk::Text(fragment.concat())).await.is_err() {
                    tracing::debug!(request_id = %response.request_id, "Stream consumer went away");
                    return;
                }
            }
            let _ = tx.send(StreamChunk::Done(StreamSummary::from(&response))).await;
        });

        ReceiverStream::new(rx)
    }

    async fn run_tiers(
        &self,
        request_id: &str,
        request: &IntegrationRequest,
        domain: ServiceDomain,
    ) -> IntegrationResponse {
        let cancel = request.cancel.as_ref();

        match self.call_primary(request_id, request, cancel).await {
            Ok(content) => {
                self.remember_answer(domain, &request.query, &content, self.primary.name())
                    .await;
                return IntegrationResponse::new(request_id, content, ResponseSource::Primary);
            }
            Err(e) => {
                self.note_failure(self.primary.name(), request_id, &e);
                if e == IntegrationError::Cancelled {
                    return self.status_response(request_id, "The request was cancelled.");
                }
                self.state.lock().metrics.fallback_activations += 1;
            }
        }

        if let Some(client) = self.direct.iter().find(|c| c.domain() == domain) {
            self.state.lock().metrics.direct_api_requests += 1;
            match with_cancellation(cancel, client.execute(&request.query)).await {
                Ok(direct) => {
                    // A stale partner entry is best-effort, not a fresh answer to remember
                    let source = if direct.stale {
                        ResponseSource::StaleCache
                    } else {
                        self.remember_answer(domain, &request.query, &direct.summary, client.name())
                            .await;
                        ResponseSource::DirectApi
                    };
                    let mut response = IntegrationResponse::new(request_id, direct.summary, source);
                    response.stale = direct.stale;
                    response.metadata.insert("service".to_string(), json!(direct.service));
                    response.metadata.insert("cached".to_string(), json!(direct.cached));
                    if direct.stale {
                        self.state.lock().metrics.cache_hits += 1;
                    }
                    return response;
                }
                Err(e) => {
                    self.note_failure(client.name(), request_id, &e);
                    if e == IntegrationError::Cancelled {
                        return self.status_response(request_id, "The request was cancelled.");
                    }
                }
            }
        }

        if let Some(response) = self.serve_from_cache(request_id, domain, &request.query).await {
            return response;
        }

        self.status_response(
            request_id,
            "All integration services are currently unavailable.",
        )
    }

    async fn call_primary(
        &self,
        request_id: &str,
        request: &IntegrationRequest,
        cancel: Option<&CancellationSignal>,
    ) -> Result<String, IntegrationError> {
        let breaker = self.breakers.get(self.primary.name());
        let mut primary_request = PrimaryRequest::new(&request.query, request_id);
        if let Some(session) = &request.session_id {
            primary_request = primary_request.with_session(session);
        }

        let payload = with_cancellation(
            cancel,
            // Only counted once the breaker admits the call
            breaker.execute(|| {
                self.state.lock().metrics.n8n_requests += 1;
                self.primary.send(&primary_request)
            }),
        )
        .await?;
        Ok(payload.format())
    }

    /// Keep a live answer so the cache tier can serve it later.
    async fn remember_answer(&self, domain: ServiceDomain, query: &str, content: &str, source: &str) {
        self.caches
            .domain(domain.fallback_cache_domain())
            .set(
                query_key(query),
                JsonValue::String(content.to_string()),
                source,
                SetOptions::default(),
            )
            .await;
    }

    async fn serve_from_cache(
        &self,
        request_id: &str,
        domain: ServiceDomain,
        query: &str,
    ) -> Option<IntegrationResponse> {
        let cache_domain = domain.fallback_cache_domain();
        let hit = self.caches.domain(cache_domain).get(&query_key(query)).await?;
        self.state.lock().metrics.cache_hits += 1;

        let content = match &hit.entry.data {
            JsonValue::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };

        let mut response = IntegrationResponse::new(request_id, content, ResponseSource::StaleCache);
        response.stale = hit.stale;
        response.metadata.insert("cache_domain".to_string(), json!(cache_domain));
        response.metadata.insert("cached_at".to_string(), json!(hit.entry.timestamp));
        response.metadata.insert("cached_from".to_string(), json!(hit.entry.source));

        self.logger.warn(
            COMPONENT,
            "request.served_from_cache",
            Some(request_id),
            json!({ "cache_domain": cache_domain, "stale": hit.stale }),
        );
        Some(response)
    }

    fn status_response(&self, request_id: &str, headline: &str) -> IntegrationResponse {
        let tiers = self.service_status();
        let available = tiers.iter().filter(|t| t.available).count();
        let overall = OverallHealth::classify(available, tiers.len());

        let mut lines = vec![headline.to_string(), String::new(), "Service status:".to_string()];
        for tier in &tiers {
            let state = tier
                .state
                .map_or_else(|| "UNKNOWN".to_string(), |s| s.to_string());
            let mut line = format!("- {}: {}", tier.tier, state);
            if let Some(error) = &tier.last_error {
                line.push_str(&format!(" (last error: {})", error));
            }
            lines.push(line);
        }
        lines.push(String::new());
        lines.push("Please try again shortly.".to_string());

        self.logger.error(
            COMPONENT,
            "request.exhausted",
            Some(request_id),
            json!({ "overall_health": overall }),
        );

        let mut response =
            IntegrationResponse::new(request_id, lines.join("\n"), ResponseSource::StatusOnly);
        response.tiers = tiers;
        response.overall_health = Some(overall);
        response
    }

    fn note_failure(&self, tier: &str, request_id: &str, error: &IntegrationError) {
        self.state
            .lock()
            .last_errors
            .insert(tier.to_string(), error.to_string());
        let data = json!({ "kind": error.kind(), "error": error.to_string() });
        if error.is_rejection() {
            self.logger.info(tier, "tier.skipped", Some(request_id), data);
        } else {
            self.logger.warn(tier, "tier.failed", Some(request_id), data);
        }
    }

    fn record_response(&self, response: &IntegrationResponse) {
        let mut state = self.state.lock();
        if state.response_times.len() == RESPONSE_TIME_SAMPLES {
            state.response_times.pop_front();
        }
        state.response_times.push_back(response.response_time_ms);
        let average = state.response_times.iter().sum::<u64>() as f64 / state.response_times.len() as f64;

        let metrics = &mut state.metrics;
        metrics.total_requests += 1;
        let n = metrics.total_requests as f64;
        let outcome = if response.source == ResponseSource::StatusOnly {
            0.0
        } else {
            100.0
        };
        metrics.success_rate = (metrics.success_rate * (n - 1.0) + outcome) / n;
        metrics.average_response_time_ms = average;
    }

    /// Breaker-level status of every tier, primary first.
    pub fn service_status(&self) -> Vec<TierStatus> {
        let errors = self.state.lock().last_errors.clone();
        let primary = self.breakers.get(self.primary.name()).health();

        std::iter::once(primary)
            .chain(self.direct.iter().map(|c| c.health()))
            .map(|health| TierStatus {
                last_error: errors.get(&health.service).cloned(),
                tier: health.service.clone(),
                available: health.is_available(),
                state: Some(health.state),
            })
            .collect()
    }

    pub fn metrics(&self) -> ResilientProviderMetrics {
        self.state.lock().metrics.clone()
    }

    /// Probe the webhook and every direct client's breaker once.
    pub async fn check_health(&self) -> OverallHealth {
        let mut probes = vec![self.primary.probe().await];
        probes.extend(self.direct.iter().map(|c| c.health().is_available()));
        let overall = OverallHealth::from_probes(probes.iter().copied());

        {
            let mut state = self.state.lock();
            state.metrics.last_health_check = Some(Utc::now());
            state.metrics.overall_health = Some(overall);
        }

        let level_data = json!({ "overall_health": overall, "probes": probes });
        if overall == OverallHealth::Healthy {
            self.logger.info(COMPONENT, "health.checked", None, level_data);
        } else {
            self.logger.warn(COMPONENT, "health.checked", None, level_data);
        }
        overall
    }

    pub async fn health_report(&self) -> HealthReport {
        let tiers = self.service_status();
        let metrics = self.metrics();
        let overall = metrics.overall_health.unwrap_or_else(|| {
            OverallHealth::classify(tiers.iter().filter(|t| t.available).count(), tiers.len())
        });

        HealthReport {
            generated_at: Utc::now(),
            overall_health: overall,
            tiers,
            breakers: self.breakers.all_health(),
            breaker_metrics: self.breakers.all_metrics(),
            caches: self.caches.all_metrics().await,
            metrics,
        }
    }

    /// Run [`check_health`](Self::check_health) every `health_check_interval`.
    pub fn start_health_checks(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.check_health().await;
            }
        });

        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!(interval = ?interval, "Health checks started");
    }

    /// Stop the health timer. Idempotent.
    pub fn destroy(&self) {
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
            tracing::info!("Health checks stopped");
        }
    }
}

impl Drop for ResilientOrchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.health_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Builder for [`ResilientOrchestrator`].
#[derive(Default)]
pub struct ResilientOrchestratorBuilder {
    primary: Option<Arc<dyn PrimaryService>>,
    direct: Vec<Arc<dyn DirectClient>>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    caches: Option<Arc<MultiTierCacheManager>>,
    logger: Option<Arc<IntegrationLogger>>,
    config: OrchestratorConfig,
}

impl ResilientOrchestratorBuilder {
    pub fn primary(mut self, primary: Arc<dyn PrimaryService>) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Add a direct client. The first client registered for a domain wins.
    pub fn direct(mut self, client: Arc<dyn DirectClient>) -> Self {
        self.direct.push(client);
        self
    }

    pub fn breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn caches(mut self, caches: Arc<MultiTierCacheManager>) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn logger(mut self, logger: Arc<IntegrationLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ResilientOrchestrator, IntegrationError> {
        let primary = self
            .primary
            .ok_or_else(|| IntegrationError::NotConfigured("No primary service set".to_string()))?;

        Ok(ResilientOrchestrator {
            primary,
            direct: self.direct,
            breakers: self.breakers.unwrap_or_default(),
            caches: self
                .caches
                .unwrap_or_else(|| Arc::new(MultiTierCacheManager::with_builtin_domains())),
            logger: self.logger.unwrap_or_default(),
            config: self.config,
            state: Mutex::new(OrchestratorState::default()),
            health_task: Mutex::new(None),
        })
    }
}
