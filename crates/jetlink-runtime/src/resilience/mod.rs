//! Resilience patterns for jetlink-runtime.
//!
//! This module provides:
//! - Circuit breaker to prevent cascade failures
//! - A per-service breaker registry
//! - Retry with backoff for transient partner failures

mod circuit_breaker;
mod manager;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use manager::CircuitBreakerManager;
pub use retry::{retry_transient, RetryPolicy};
