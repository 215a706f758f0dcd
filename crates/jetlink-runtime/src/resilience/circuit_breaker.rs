//! Circuit breaker to prevent cascade failures.
//!
//! When calls to an upstream fail repeatedly, the circuit opens and
//! subsequent calls are refused without touching the network until the
//! recovery timeout elapses.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use jetlink_core::{CircuitBreakerMetrics, CircuitState, IntegrationError, ServiceHealth};

use crate::config::duration_str;

/// Samples kept for the response-time mean.
const RESPONSE_TIME_SAMPLES: usize = 100;

/// Circuit breaker configuration. Fixed for the lifetime of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time before attempting recovery
    #[serde(with = "duration_str")]
    pub recovery_timeout: Duration,

    /// Upper bound on a single call
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u32,

    /// Successes needed to close circuit
    pub success_threshold: u32,

    /// Window the monitor uses when judging error rates
    #[serde(with = "duration_str")]
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            success_threshold: 2,
            monitoring_window: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    /// Named default for a known service, generic default otherwise.
    pub fn for_service(service: &str) -> Self {
        match service {
            "n8n" => Self::default(),
            "apollo" => Self {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(30),
                request_timeout: Duration::from_secs(15),
                half_open_max_calls: 2,
                success_threshold: 2,
                monitoring_window: Duration::from_secs(180),
            },
            "avinode" => Self {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(45),
                request_timeout: Duration::from_secs(20),
                half_open_max_calls: 2,
                success_threshold: 2,
                monitoring_window: Duration::from_secs(180),
            },
            "llm" => Self {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(30),
                request_timeout: Duration::from_secs(60),
                half_open_max_calls: 3,
                success_threshold: 2,
                monitoring_window: Duration::from_secs(300),
            },
            _ => Self::default(),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    response_times: VecDeque<Duration>,

    /// Completion time and failure flag of each call inside the monitoring window
    outcomes: VecDeque<(Instant, bool)>,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    metrics: CircuitBreakerMetrics,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt: None,
            opened_at: None,
            half_open_in_flight: 0,
            response_times: VecDeque::with_capacity(RESPONSE_TIME_SAMPLES),
            outcomes: VecDeque::new(),
            last_failure: None,
            last_success: None,
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    fn record_response_time(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_TIME_SAMPLES {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }

    fn record_outcome(&mut self, failed: bool, window: Duration) {
        let now = Instant::now();
        self.outcomes.push_back((now, failed));
        self.prune_outcomes(now, window);
    }

    fn prune_outcomes(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) <= window {
                break;
            }
            self.outcomes.pop_front();
        }
    }

    /// Requests and failures still inside the window.
    fn window_counts(&mut self, window: Duration) -> (u64, u64) {
        self.prune_outcomes(Instant::now(), window);
        let failures = self.outcomes.iter().filter(|(_, failed)| *failed).count();
        (self.outcomes.len() as u64, failures as u64)
    }

    fn average_response_time_ms(&self) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .response_times
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .sum();
        total / self.response_times.len() as f64
    }
}

/// Circuit breaker guarding one named upstream.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    created_at: Instant,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        tracing::debug!(
            service = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout = ?config.recovery_timeout,
            "Circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::new()),
            created_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` under breaker protection.
    ///
    /// Refused with [`IntegrationError::CircuitOpen`] while open. Otherwise
    /// the call is bounded by `request_timeout`; a timeout is recorded as a
    /// failure like any other error.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, IntegrationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        let trial = self.admit()?;
        let mut slot = TrialSlot {
            breaker: self,
            held: trial,
        };

        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.request_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(IntegrationError::Timeout {
                service: self.name.clone(),
                timeout: self.config.request_timeout,
            }),
        };
        let elapsed = started.elapsed();
        slot.held = false;

        match &outcome {
            Ok(_) => self.on_success(elapsed, trial),
            Err(e) => self.on_failure(elapsed, trial, e),
        }

        outcome
    }

    /// Admission check. Returns whether the call is a half-open trial.
    fn admit(&self) -> Result<bool, IntegrationError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.state == CircuitState::Open {
            let ready = inner.next_attempt.map_or(true, |at| now >= at);
            if !ready {
                inner.metrics.rejected_requests += 1;
                return Err(IntegrationError::CircuitOpen {
                    service: self.name.clone(),
                });
            }
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.half_open_in_flight = 0;
            tracing::info!(service = %self.name, "Circuit transitioning to half-open for recovery test");
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_in_flight >= self.config.half_open_max_calls {
                inner.metrics.rejected_requests += 1;
                return Err(IntegrationError::CircuitOpen {
                    service: self.name.clone(),
                });
            }
            inner.half_open_in_flight += 1;
            return Ok(true);
        }

        Ok(false)
    }

    fn on_success(&self, elapsed: Duration, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.record_response_time(elapsed);
        inner.record_outcome(false, self.config.monitoring_window);
        inner.metrics.total_requests += 1;
        inner.metrics.successful_requests += 1;
        inner.last_success = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition_to_closed(&mut inner);
                    tracing::info!(service = %self.name, "Circuit closed after successful recovery");
                }
            }
            CircuitState::Closed => {
                // A single success forgives prior failures
                inner.failure_count = 0;
            }
            CircuitState::Open => {
                tracing::debug!(service = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    fn on_failure(&self, elapsed: Duration, trial: bool, error: &IntegrationError) {
        let mut inner = self.inner.lock();
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.record_response_time(elapsed);
        inner.record_outcome(true, self.config.monitoring_window);
        inner.metrics.total_requests += 1;
        inner.metrics.failed_requests += 1;
        if matches!(error, IntegrationError::Timeout { .. }) {
            inner.metrics.timeouts += 1;
        }
        inner.failure_count += 1;
        inner.last_failure = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition_to_open(&mut inner);
                tracing::warn!(
                    service = %self.name,
                    error = %error,
                    "Circuit reopened after failed recovery attempt"
                );
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.transition_to_open(&mut inner);
                tracing::warn!(
                    service = %self.name,
                    failures = inner.failure_count,
                    error = %error,
                    "Circuit opened after repeated failures"
                );
            }
            _ => {
                tracing::debug!(
                    service = %self.name,
                    failures = inner.failure_count,
                    error = %error,
                    "Call failed"
                );
            }
        }
    }

    fn transition_to_open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.next_attempt = Some(Instant::now() + self.config.recovery_timeout);
        inner.opened_at = Some(Utc::now());
        inner.half_open_in_flight = 0;
        inner.metrics.circuit_open_count += 1;
    }

    fn transition_to_closed(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt = None;
        inner.opened_at = None;
        inner.half_open_in_flight = 0;
    }

    /// Current state, without triggering the open -> half-open transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call made now would be admitted. Has no side effects.
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.half_open_in_flight < self.config.half_open_max_calls,
            CircuitState::Open => inner.next_attempt.map_or(true, |at| Instant::now() >= at),
        }
    }

    /// How long the circuit has been open, if it is.
    pub fn open_duration(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        inner
            .next_attempt
            .map(|at| (Instant::now() + self.config.recovery_timeout).saturating_duration_since(at))
    }

    /// Snapshot of the breaker.
    pub fn health(&self) -> ServiceHealth {
        let mut inner = self.inner.lock();
        let (window_requests, window_failures) = inner.window_counts(self.config.monitoring_window);
        ServiceHealth {
            service: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            request_count: inner.metrics.total_requests,
            total_failures: inner.metrics.failed_requests,
            window_requests,
            window_failures,
            average_response_time_ms: inner.average_response_time_ms(),
            last_failure_time: inner.last_failure,
            last_success_time: inner.last_success,
            opened_at: inner.opened_at,
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    /// Cumulative counters.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            average_response_time_ms: inner.average_response_time_ms(),
            ..inner.metrics.clone()
        }
    }

    /// Open the circuit regardless of counters.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition_to_open(&mut inner);
        tracing::warn!(service = %self.name, "Circuit forced open");
    }

    /// Close the circuit regardless of counters. Cumulative metrics survive.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.transition_to_closed(&mut inner);
        tracing::info!(service = %self.name, "Circuit forced closed");
    }

    /// Return to the freshly-created state. Idempotent.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::new();
        tracing::info!(service = %self.name, "Circuit reset");
    }
}

/// Half-open admission held by an in-flight trial call.
///
/// Released without recording an outcome if the call is dropped mid-flight.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            let mut inner = self.breaker.inner.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing() -> impl Future<Output = Result<(), IntegrationError>> {
        async {
            Err(IntegrationError::UpstreamRejected {
                service: "test".into(),
                status: 500,
                message: "boom".into(),
            })
        }
    }

    fn config(failures: u32, successes: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            recovery_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            half_open_max_calls: 3,
            success_threshold: successes,
            monitoring_window: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("n8n", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_available());
    }

    #[tokio::test]
    async fn test_opens_after_exactly_threshold_failures() {
        for threshold in 1..=6 {
            let cb = CircuitBreaker::new("svc", config(threshold, 2));
            for i in 0..threshold {
                assert_eq!(cb.state(), CircuitState::Closed, "opened early at failure {}", i);
                let _ = cb.execute(failing).await;
            }
            assert_eq!(cb.state(), CircuitState::Open);
        }
    }

    #[tokio::test]
    async fn test_open_circuit_never_invokes_operation() {
        let cb = CircuitBreaker::new("svc", config(1, 2));
        let _ = cb.execute(failing).await;

        let calls = AtomicU32::new(0);
        for _ in 0..5 {
            let result = cb
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(matches!(result, Err(IntegrationError::CircuitOpen { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().rejected_requests, 5);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = CircuitBreaker::new("svc", config(3, 2));

        let _ = cb.execute(failing).await;
        let _ = cb.execute(failing).await;
        cb.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(cb.health().failure_count, 0);

        let _ = cb.execute(failing).await;
        let _ = cb.execute(failing).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery_closes_circuit() {
        let cb = CircuitBreaker::new("svc", config(1, 2));
        let _ = cb.execute(failing).await;
        assert!(!cb.is_available());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.is_available());

        cb.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_without_partial_credit() {
        let cb = CircuitBreaker::new("svc", config(1, 3));
        let _ = cb.execute(failing).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        cb.execute(|| async { Ok(()) }).await.unwrap();
        cb.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(cb.health().success_count, 2);

        let _ = cb.execute(failing).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().circuit_open_count, 2);

        // Next half-open attempt starts from zero
        tokio::time::advance(Duration::from_secs(31)).await;
        cb.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.health().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_trials() {
        let mut cfg = config(1, 2);
        cfg.half_open_max_calls = 1;
        let cb = CircuitBreaker::new("svc", cfg);
        let _ = cb.execute(failing).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let (slow, excess) = tokio::join!(
            cb.execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            }),
            cb.execute(|| async { Ok(()) }),
        );
        assert!(slow.is_ok());
        assert!(matches!(excess, Err(IntegrationError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_releases_half_open_slot() {
        let mut cfg = config(1, 2);
        cfg.half_open_max_calls = 1;
        let cb = CircuitBreaker::new("svc", cfg);
        let _ = cb.execute(failing).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_available());

        cb.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(cb.health().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let mut cfg = config(1, 2);
        cfg.request_timeout = Duration::from_millis(100);
        let cb = CircuitBreaker::new("slow", cfg);

        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(IntegrationError::Timeout { .. })));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_six_failures_never_closed() {
        let cb = CircuitBreaker::new("n8n", CircuitBreakerConfig::for_service("n8n"));
        for _ in 0..6 {
            let _ = cb.execute(failing).await;
        }
        assert!(matches!(
            cb.health().state,
            CircuitState::Open | CircuitState::HalfOpen
        ));
        assert!(cb.metrics().circuit_open_count >= 1);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let cb = CircuitBreaker::new("svc", config(1, 2));
        let _ = cb.execute(failing).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        let once = cb.health();
        cb.reset();
        let twice = cb.health();

        assert_eq!(once.state, CircuitState::Closed);
        assert_eq!(twice.state, CircuitState::Closed);
        assert_eq!(once.failure_count, twice.failure_count);
        assert_eq!(once.success_count, twice.success_count);
        assert_eq!(once.request_count, twice.request_count);
        assert_eq!(twice.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_forgets_old_outcomes() {
        let cb = CircuitBreaker::new("svc", config(100, 2));
        for _ in 0..10 {
            cb.execute(|| async { Ok::<_, IntegrationError>(()) }).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..2 {
            let _ = cb.execute(failing).await;
        }

        let health = cb.health();
        assert_eq!(health.request_count, 12);
        assert_eq!(health.window_requests, 2);
        assert_eq!(health.window_failures, 2);
        assert_eq!(health.window_error_rate(), 100.0);
        assert!(health.error_rate() < 20.0);

        tokio::time::advance(Duration::from_secs(61)).await;
        let idle = cb.health();
        assert_eq!(idle.window_requests, 0);
        assert_eq!(idle.window_error_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_force_open_and_close() {
        let cb = CircuitBreaker::new("svc", CircuitBreakerConfig::default());
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.open_duration().is_some());

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.open_duration().is_none());
    }

    #[test]
    fn test_named_defaults() {
        assert_eq!(CircuitBreakerConfig::for_service("apollo").failure_threshold, 3);
        assert_eq!(
            CircuitBreakerConfig::for_service("llm").request_timeout,
            Duration::from_secs(60)
        );
        assert_eq!(
            CircuitBreakerConfig::for_service("unknown"),
            CircuitBreakerConfig::default()
        );
    }
}
