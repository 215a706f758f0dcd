//! Response shapes: what upstreams send back and what callers receive.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use crate::health::{CircuitState, OverallHealth};

/// A webhook body, discriminated once at the formatting boundary.
///
/// The workflow backend answers in whichever of these shapes its last node
/// produced. Fields are checked in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookPayload {
    Message(String),
    Text(String),
    Result(JsonValue),
    Data(JsonValue),
    Raw(JsonValue),
}

impl WebhookPayload {
    /// Discriminate a parsed JSON body.
    ///
    /// Workflow backends commonly wrap a single item in a one-element
    /// array; that wrapper is unpacked before inspection.
    pub fn from_json(body: JsonValue) -> Self {
        let body = match body {
            JsonValue::Array(mut items) if items.len() == 1 => items.remove(0),
            other => other,
        };

        if let JsonValue::Object(ref map) = body {
            if let Some(JsonValue::String(message)) = map.get("message") {
                return Self::Message(message.clone());
            }
            if let Some(JsonValue::String(text)) = map.get("text") {
                return Self::Text(text.clone());
            }
            if let Some(result) = map.get("result") {
                return Self::Result(result.clone());
            }
            if let Some(data) = map.get("data") {
                return Self::Data(data.clone());
            }
        }

        Self::Raw(body)
    }

    /// Discriminate a raw response body that may not be JSON at all.
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<JsonValue>(body) {
            Ok(json) => Self::from_json(json),
            Err(_) => Self::Text(body.to_string()),
        }
    }

    /// Whether the backend answered with nothing useful.
    ///
    /// An empty object usually means the workflow is not activated.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Message(s) | Self::Text(s) => s.trim().is_empty(),
            Self::Result(v) | Self::Data(v) | Self::Raw(v) => is_empty_json(v),
        }
    }

    /// Render for display.
    pub fn format(&self) -> String {
        match self {
            Self::Message(s) | Self::Text(s) => s.clone(),
            Self::Result(v) | Self::Data(v) | Self::Raw(v) => render_json(v),
        }
    }
}

fn is_empty_json(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn render_json(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Which fallback tier produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    Primary,
    DirectApi,
    StaleCache,
    StatusOnly,
}

impl ResponseSource {
    /// Whether the answer came from a live upstream.
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Self::Primary | Self::DirectApi)
    }
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseSource::Primary => write!(f, "primary"),
            ResponseSource::DirectApi => write!(f, "direct-api"),
            ResponseSource::StaleCache => write!(f, "stale-cache"),
            ResponseSource::StatusOnly => write!(f, "status-only"),
        }
    }
}

/// Partner domain a free-text request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceDomain {
    Apollo,
    Avinode,
    General,
}

const APOLLO_KEYWORDS: &[&str] = &["apollo", "campaign", "lead", "executive"];
const AVINODE_KEYWORDS: &[&str] = &["avinode", "aircraft", "fleet", "flight"];

impl ServiceDomain {
    /// Keyword classification. Apollo vocabulary wins when both match.
    pub fn classify(query: &str) -> Self {
        let query = query.to_lowercase();
        if APOLLO_KEYWORDS.iter().any(|k| query.contains(k)) {
            Self::Apollo
        } else if AVINODE_KEYWORDS.iter().any(|k| query.contains(k)) {
            Self::Avinode
        } else {
            Self::General
        }
    }

    /// Cache domain holding fallback answers for this classification.
    pub fn fallback_cache_domain(&self) -> &'static str {
        match self {
            Self::Apollo => "apollo-leads",
            Self::Avinode => "avinode-aircraft",
            Self::General => "n8n-responses",
        }
    }
}

/// Health of one fallback tier, as reported in status-only responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierStatus {
    pub tier: String,
    pub state: Option<CircuitState>,
    pub available: bool,
    pub last_error: Option<String>,
}

/// What every public orchestrator entry point returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResponse {
    pub request_id: String,
    pub content: String,
    pub source: ResponseSource,

    /// True when served from cache past its ttl
    pub stale: bool,

    pub response_time_ms: u64,

    /// Populated for status-only responses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<TierStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_health: Option<OverallHealth>,

    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
}

impl IntegrationResponse {
    pub fn new(request_id: impl Into<String>, content: impl Into<String>, source: ResponseSource) -> Self {
        Self {
            request_id: request_id.into(),
            content: content.into(),
            source,
            stale: false,
            response_time_ms: 0,
            tiers: Vec::new(),
            overall_health: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.source != ResponseSource::Primary
    }
}
