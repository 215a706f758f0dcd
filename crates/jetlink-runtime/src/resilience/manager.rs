//! Registry of one circuit breaker per named service.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use jetlink_core::{CircuitBreakerMetrics, CircuitState, ServiceHealth};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

/// Lazily creates and caches breakers by service name.
///
/// Each service has its own circuit to allow independent recovery.
#[derive(Default)]
pub struct CircuitBreakerManager {
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,

    /// Per-service config used instead of the named default on creation
    overrides: BTreeMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with configuration overrides keyed by service name.
    pub fn with_overrides(overrides: BTreeMap<String, CircuitBreakerConfig>) -> Self {
        Self {
            breakers: RwLock::new(BTreeMap::new()),
            overrides,
        }
    }

    /// Get the breaker for `service`, creating it on first use.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(service) {
            return Arc::clone(breaker);
        }

        let config = self
            .overrides
            .get(service)
            .cloned()
            .unwrap_or_else(|| CircuitBreakerConfig::for_service(service));
        self.get_or_create(service, config)
    }

    /// Get the breaker for `service`, creating it with `config` if absent.
    ///
    /// An existing breaker keeps its original config.
    pub fn get_or_create(&self, service: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config))),
        )
    }

    /// Names of every breaker created so far.
    pub fn service_names(&self) -> Vec<String> {
        self.breakers.read().keys().cloned().collect()
    }

    pub fn all_health(&self) -> Vec<ServiceHealth> {
        self.snapshot().iter().map(|b| b.health()).collect()
    }

    pub fn all_metrics(&self) -> BTreeMap<String, CircuitBreakerMetrics> {
        self.snapshot()
            .iter()
            .map(|b| (b.name().to_string(), b.metrics()))
            .collect()
    }

    /// Services currently refusing calls.
    pub fn open_services(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.name().to_string())
            .collect()
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
    }

    /// Clone out the breakers so no lock is held while calling into them.
    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }
}
