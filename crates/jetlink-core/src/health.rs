//! Health snapshots and aggregate health classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Circuit is open, all calls bypass
    Open,

    /// Testing if circuit can close
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Read-only snapshot of one breaker, recomputed on every execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub request_count: u64,

    /// Failures since creation; unlike `failure_count` never reset
    pub total_failures: u64,

    /// Calls completed within the breaker's monitoring window
    #[serde(default)]
    pub window_requests: u64,

    #[serde(default)]
    pub window_failures: u64,

    /// Arithmetic mean over the last 100 calls
    pub average_response_time_ms: f64,

    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,

    /// When the circuit last opened, if it is currently open
    pub opened_at: Option<DateTime<Utc>>,

    /// Seconds since the breaker was created
    pub uptime_secs: u64,
}

impl ServiceHealth {
    /// Error rate in percent over all recorded requests.
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.request_count as f64 * 100.0
    }

    /// Error rate in percent over the monitoring window only.
    pub fn window_error_rate(&self) -> f64 {
        if self.window_requests == 0 {
            return 0.0;
        }
        self.window_failures as f64 / self.window_requests as f64 * 100.0
    }

    pub fn is_available(&self) -> bool {
        self.state != CircuitState::Open
    }
}

/// Cumulative counters for one breaker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,

    /// Calls refused without invoking the operation
    pub rejected_requests: u64,

    /// Number of CLOSED/HALF_OPEN -> OPEN transitions
    pub circuit_open_count: u64,

    pub average_response_time_ms: f64,
}

impl CircuitBreakerMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64 * 100.0
    }
}

/// Aggregate health across a set of probes or services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

impl OverallHealth {
    /// Classify from pass/total counts.
    ///
    /// Healthy iff everything passes, critical iff nothing does. An empty
    /// set has nothing failing and is healthy.
    pub fn classify(passing: usize, total: usize) -> Self {
        if passing == total {
            OverallHealth::Healthy
        } else if passing == 0 {
            OverallHealth::Critical
        } else {
            OverallHealth::Degraded
        }
    }

    /// Classify from individual probe results.
    pub fn from_probes<I: IntoIterator<Item = bool>>(probes: I) -> Self {
        let (passing, total) = probes
            .into_iter()
            .fold((0, 0), |(p, t), ok| (p + usize::from(ok), t + 1));
        Self::classify(passing, total)
    }
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallHealth::Healthy => write!(f, "healthy"),
            OverallHealth::Degraded => write!(f, "degraded"),
            OverallHealth::Critical => write!(f, "critical"),
        }
    }
}
