//! Upstream clients.
//!
//! - [`N8nWebhook`] is the primary workflow backend ([`PrimaryService`])
//! - [`ApolloClient`] and [`AvinodeClient`] are the partner APIs used when the
//!   primary tier fails ([`DirectClient`])
//!
//! Partner clients own their breaker and cache; the webhook's breaker is
//! owned by the orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jetlink_core::{IntegrationError, ServiceDomain, ServiceHealth, WebhookPayload};

mod apollo;
mod avinode;
pub mod credentials;
mod http;
#[cfg(test)]
mod testing;
mod webhook;

pub use apollo::{ApolloClient, LeadSearch, APOLLO_API_KEY_ENV};
pub use avinode::{AircraftSearch, AvinodeClient, AVINODE_API_KEY_ENV};
pub use credentials::{ApiCredential, CredentialSource};
pub use http::{PartnerHttp, PartnerReply};
pub use webhook::N8nWebhook;

/// One request to the primary workflow backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryRequest {
    pub query: String,
    pub request_id: String,
    pub session_id: String,

    /// Interaction mode forwarded in the payload context
    pub mode: String,
}

impl PrimaryRequest {
    pub fn new(query: impl Into<String>, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        Self {
            query: query.into(),
            session_id: format!("session_{}", request_id.trim_start_matches("req_")),
            request_id,
            mode: "chat".to_string(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

/// The primary workflow backend.
#[async_trait]
pub trait PrimaryService: Send + Sync {
    fn name(&self) -> &str;

    /// Send one request. An empty answer is an error.
    async fn send(&self, request: &PrimaryRequest) -> Result<WebhookPayload, IntegrationError>;

    /// Cheap reachability check for the health timer.
    async fn probe(&self) -> bool;
}

/// What a partner API returned, already summarized for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectResponse {
    pub service: String,
    pub summary: String,
    pub data: JsonValue,

    /// Served from the client's own cache
    pub cached: bool,

    /// Cached past its ttl; the live call failed
    #[serde(default)]
    pub stale: bool,
}

/// A partner API reachable without the workflow backend.
#[async_trait]
pub trait DirectClient: Send + Sync {
    fn name(&self) -> &str;

    /// Which classified requests this client answers.
    fn domain(&self) -> ServiceDomain;

    /// Answer a free-text request.
    async fn execute(&self, query: &str) -> Result<DirectResponse, IntegrationError>;

    /// Health of the client's circuit breaker.
    fn health(&self) -> ServiceHealth;
}
