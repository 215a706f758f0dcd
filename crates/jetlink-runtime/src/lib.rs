//! # jetlink-runtime
//!
//! Async machinery for the jetlink integration layer.
//!
//! Requests flow through [`ResilientOrchestrator`], which tries the n8n
//! workflow webhook first, then the partner API matching the request, then
//! any cached answer, and finally answers with a status report. Every
//! upstream call is guarded by its own [`CircuitBreaker`].
//!
//! Alongside the request path:
//! - [`DataSyncManager`] reconciles records fetched from several sources
//! - [`ServiceMonitor`] watches breaker health, raises alerts and resets
//!   breakers that stay open too long
//! - [`MultiTierCacheManager`] holds one stale-while-revalidate cache per
//!   data domain
//!
//! Nothing here is global. The process composition root builds the breaker
//! registry, cache registry and logger once and hands `Arc`s to every
//! component.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jetlink_runtime::{
//!     IntegrationConfig, IntegrationRequest, N8nWebhook, ResilientOrchestrator,
//! };
//!
//! let config = IntegrationConfig::default().apply_env()?;
//! let orchestrator = ResilientOrchestrator::builder()
//!     .primary(Arc::new(N8nWebhook::new(&config.webhook)?))
//!     .config(config.orchestrator.clone())
//!     .build()?;
//!
//! let response = orchestrator
//!     .generate(IntegrationRequest::new("Find CEOs of aviation companies in Miami"))
//!     .await;
//! println!("[{}] {}", response.source, response.content);
//! ```

pub mod cache;
pub mod clients;
pub mod config;
pub mod logger;
pub mod monitor;
pub mod orchestrator;
pub mod resilience;
pub mod sync;

pub use cache::{CacheHit, CacheManager, CacheMetrics, MultiTierCacheManager, SetOptions};
pub use clients::{
    ApiCredential, ApolloClient, AvinodeClient, DirectClient, DirectResponse, N8nWebhook,
    PartnerReply, PrimaryRequest, PrimaryService,
};
pub use config::{
    CacheConfig, ConfigError, IntegrationConfig, MonitorConfig, OrchestratorConfig,
    PartnerConfig, WebhookConfig,
};
pub use logger::{new_request_id, IntegrationEvent, IntegrationLogger, LogLevel};
pub use monitor::{MonitorReport, ServiceMonitor};
pub use orchestrator::{
    CancellationHandle, CancellationSignal, HealthReport, IntegrationRequest,
    ResilientOrchestrator, ResilientOrchestratorBuilder, ResilientProviderMetrics, StreamChunk,
    StreamSummary,
};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, RetryPolicy};
pub use sync::{DataSyncManager, SourceFetch, SyncOutcome};
