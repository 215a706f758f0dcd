//! # jetlink-core
//!
//! Deterministic domain model for the jetlink integration layer.
//!
//! This crate holds everything about the integration layer that can be
//! decided without doing I/O:
//! - Circuit and service health snapshots, aggregate health classification
//! - Cache entries, freshness windows and deterministic cache keys
//! - Sync policies, validation rules and conflict resolution
//! - Service alerts
//! - Response shapes and fallback-tier labels
//!
//! The async machinery that drives these (breakers, caches, orchestrator,
//! monitor) lives in `jetlink-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use jetlink_core::cache::generate_key;
//! use serde_json::json;
//!
//! let a = generate_key("leads", &json!({"title": "CEO", "city": "NYC"}));
//! let b = generate_key("leads", &json!({"city": "NYC", "title": "CEO"}));
//! assert_eq!(a, b);
//! ```

pub mod alert;
pub mod cache;
pub mod error;
pub mod health;
pub mod response;
pub mod sync;

// Re-export main types at crate root
pub use alert::{AlertCondition, AlertLevel, ServiceAlert};
pub use cache::{generate_key, query_key, CacheEntry, CachePolicy, Freshness};
pub use error::{IntegrationError, SyncError};
pub use health::{CircuitBreakerMetrics, CircuitState, OverallHealth, ServiceHealth};
pub use response::{
    IntegrationResponse, ResponseSource, ServiceDomain, TierStatus, WebhookPayload,
};
pub use sync::{
    ConflictResolution, DataConflict, DataSource, SourceResult, SyncPolicy, ValidationRule,
};
