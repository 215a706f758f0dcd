//! Error taxonomy shared by every integration tier.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to an upstream dependency.
///
/// Circuit breakers treat every variant as a failure except
/// [`IntegrationError::CircuitOpen`], which is produced by the breaker
/// itself before any call is made.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrationError {
    #[error("Network failure calling {service}: {message}")]
    TransientNetwork { service: String, message: String },

    #[error("{service} timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    #[error("{service} rejected the request: {status} - {message}")]
    UpstreamRejected {
        service: String,
        status: u16,
        message: String,
    },

    #[error("Circuit breaker is open for {service}")]
    CircuitOpen { service: String },

    #[error("Validation failed for field '{field}': {message}")]
    ValidationFailed { field: String, message: String },

    #[error("All fallback tiers exhausted")]
    AllTiersExhausted,

    #[error("Failed to parse response from {service}: {message}")]
    Parse { service: String, message: String },

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl IntegrationError {
    /// Whether a retry inside the same breaker execution could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork { .. } => true,
            Self::UpstreamRejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether this error was raised before the upstream was contacted.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::Cancelled)
    }

    /// Short machine-readable kind, used in logs and status responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientNetwork { .. } => "transient_network",
            Self::Timeout { .. } => "timeout",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::AllTiersExhausted => "all_tiers_exhausted",
            Self::Parse { .. } => "parse",
            Self::NotConfigured(_) => "not_configured",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors from a data-reconciliation pass.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Missing required sources for {data_type}: {missing:?}")]
    MissingRequiredSources {
        data_type: String,
        missing: Vec<String>,
    },

    #[error("No valid source produced data for {data_type}:{key}")]
    NoValidSources { data_type: String, key: String },

    #[error("No sync policy registered for data type '{0}'")]
    UnknownPolicy(String),

    #[error("Conflict index {0} does not exist")]
    UnknownConflict(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let net = IntegrationError::TransientNetwork {
            service: "apollo".into(),
            message: "connection refused".into(),
        };
        assert!(net.is_transient());

        let server = IntegrationError::UpstreamRejected {
            service: "apollo".into(),
            status: 503,
            message: "unavailable".into(),
        };
        assert!(server.is_transient());

        let client = IntegrationError::UpstreamRejected {
            service: "apollo".into(),
            status: 401,
            message: "unauthorized".into(),
        };
        assert!(!client.is_transient());
        assert!(!IntegrationError::CircuitOpen { service: "n8n".into() }.is_transient());
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(IntegrationError::AllTiersExhausted.kind(), "all_tiers_exhausted");
        assert!(IntegrationError::Cancelled.is_rejection());
    }
}
