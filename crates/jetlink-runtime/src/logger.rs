//! In-memory integration event log.
//!
//! Every event is also emitted through `tracing`, so the ring is only needed
//! for per-request inspection (`events_for`) and status reports.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::fmt;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Generate a request id of the form `req_<uuid>`.
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,

    /// Emitting component, e.g. `orchestrator` or `apollo`
    pub component: String,
    pub event: String,
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub data: JsonValue,
}

/// Bounded ring of recent integration events.
pub struct IntegrationLogger {
    capacity: usize,
    events: Mutex<VecDeque<IntegrationEvent>>,
}

impl Default for IntegrationLogger {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl IntegrationLogger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record an event and mirror it to tracing.
    pub fn log(
        &self,
        level: LogLevel,
        component: &str,
        event: &str,
        request_id: Option<&str>,
        data: JsonValue,
    ) {
        let request = request_id.unwrap_or("-");
        match level {
            LogLevel::Debug => {
                tracing::debug!(component = %component, request_id = %request, data = %data, "{}", event)
            }
            LogLevel::Info => {
                tracing::info!(component = %component, request_id = %request, data = %data, "{}", event)
            }
            LogLevel::Warn => {
                tracing::warn!(component = %component, request_id = %request, data = %data, "{}", event)
            }
            LogLevel::Error => {
                tracing::error!(component = %component, request_id = %request, data = %data, "{}", event)
            }
        }

        let entry = IntegrationEvent {
            timestamp: Utc::now(),
            level,
            component: component.to_string(),
            event: event.to_string(),
            request_id: request_id.map(str::to_string),
            data,
        };

        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(entry);
    }

    pub fn info(&self, component: &str, event: &str, request_id: Option<&str>, data: JsonValue) {
        self.log(LogLevel::Info, component, event, request_id, data);
    }

    pub fn warn(&self, component: &str, event: &str, request_id: Option<&str>, data: JsonValue) {
        self.log(LogLevel::Warn, component, event, request_id, data);
    }

    pub fn error(&self, component: &str, event: &str, request_id: Option<&str>, data: JsonValue) {
        self.log(LogLevel::Error, component, event, request_id, data);
    }

    /// Events for one request, oldest first.
    pub fn events_for(&self, request_id: &str) -> Vec<IntegrationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.request_id.as_deref() == Some(request_id))
            .cloned()
            .collect()
    }

    /// The last `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<IntegrationEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn errors_since(&self, since: DateTime<Utc>) -> Vec<IntegrationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == LogLevel::Error && e.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
