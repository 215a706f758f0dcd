//! Service alerts raised by the monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// The condition an alert was raised for, used for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    HighErrorRate,
    HighLatency,
    ServiceDown,
    Recovered,
    Manual,
}

/// An alert about one service.
///
/// Created by threshold checks or manually; mutated only by [`ServiceAlert::resolve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAlert {
    pub id: String,
    pub service_name: String,
    pub level: AlertLevel,
    pub condition: AlertCondition,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, JsonValue>,
}

impl ServiceAlert {
    pub fn new(
        service_name: impl Into<String>,
        level: AlertLevel,
        condition: AlertCondition,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("alert_{}", uuid::Uuid::new_v4().simple()),
            service_name: service_name.into(),
            level,
            condition,
            message: message.into(),
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Mark resolved. Returns false if it already was.
    pub fn resolve(&mut self) -> bool {
        if self.resolved {
            return false;
        }
        self.resolved = true;
        self.resolved_at = Some(Utc::now());
        true
    }

    /// Whether this unresolved alert already covers `service`/`condition`.
    pub fn covers(&self, service: &str, condition: AlertCondition) -> bool {
        !self.resolved && self.service_name == service && self.condition == condition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_one_shot() {
        let mut alert = ServiceAlert::new(
            "apollo",
            AlertLevel::Critical,
            AlertCondition::ServiceDown,
            "apollo is down",
        );
        assert!(alert.covers("apollo", AlertCondition::ServiceDown));

        assert!(alert.resolve());
        assert!(alert.resolved_at.is_some());
        assert!(!alert.resolve());
        assert!(!alert.covers("apollo", AlertCondition::ServiceDown));
    }

    #[test]
    fn test_alert_ids_are_unique() {
        let a = ServiceAlert::new("n8n", AlertLevel::Info, AlertCondition::Manual, "a");
        let b = ServiceAlert::new("n8n", AlertLevel::Info, AlertCondition::Manual, "b");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("alert_"));
    }

    #[test]
    fn test_level_ordering() {
        assert!(AlertLevel::Critical > AlertLevel::Warning);
        assert!(AlertLevel::Warning > AlertLevel::Info);
    }
}
