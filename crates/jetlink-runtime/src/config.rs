//! Runtime configuration.
//!
//! Loaded from YAML with human-readable durations (`"30s"`, `"5m"`), then
//! overridden from the environment.
//!
//! ```yaml
//! webhook:
//!   url: https://n8n.example.com/webhook/jetvision-agent
//!   timeout: 30s
//! apollo:
//!   base_url: https://api.apollo.io/v1
//!   min_request_interval: 1s
//! monitor:
//!   error_rate_threshold: 50.0
//!   latency_threshold: 5s
//! circuit_breakers:
//!   n8n:
//!     failure_threshold: 5
//!     recovery_timeout: 1m
//!     request_timeout: 30s
//!     half_open_max_calls: 3
//!     success_threshold: 2
//!     monitoring_window: 5m
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use jetlink_core::CachePolicy;

use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde adapter for `Duration` as a humantime string.
///
/// Plain integers are accepted as seconds.
pub(crate) mod duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(u64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => humantime::parse_duration(&text).map_err(de::Error::custom),
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

/// Primary workflow webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,

    #[serde(with = "duration_str")]
    pub timeout: Duration,

    /// Value of `context.source` in every payload
    pub source: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5678/webhook/jetvision-agent".to_string(),
            timeout: Duration::from_secs(30),
            source: "jetvision-agent".to_string(),
        }
    }
}

/// One partner REST API. `base_url` is required when the section is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerConfig {
    pub base_url: String,

    /// Falls back to the partner's environment variable when absent
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_partner_timeout", with = "duration_str")]
    pub timeout: Duration,

    /// Minimum spacing between two requests
    #[serde(default = "default_request_interval", with = "duration_str")]
    pub min_request_interval: Duration,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_partner_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_request_interval() -> Duration {
    Duration::from_secs(1)
}

impl PartnerConfig {
    pub fn apollo() -> Self {
        Self {
            base_url: "https://api.apollo.io/v1".to_string(),
            api_key: None,
            timeout: Duration::from_secs(15),
            min_request_interval: Duration::from_millis(1000),
            retry: RetryPolicy::default(),
        }
    }

    pub fn avinode() -> Self {
        Self {
            base_url: "https://api.avinode.com/api".to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            min_request_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(with = "duration_str")]
    pub health_check_interval: Duration,

    /// Pause between streamed fragments
    #[serde(with = "duration_str")]
    pub stream_chunk_delay: Duration,

    /// Words per streamed fragment
    pub stream_chunk_words: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            stream_chunk_delay: Duration::from_millis(20),
            stream_chunk_words: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_str")]
    pub check_interval: Duration,

    /// Percent
    pub error_rate_threshold: f64,

    #[serde(with = "duration_str")]
    pub latency_threshold: Duration,

    /// Time a circuit may stay open before auto-recovery
    #[serde(with = "duration_str")]
    pub recovery_grace_period: Duration,

    /// Requests inside a breaker's monitoring window before its error rate is judged
    pub min_requests: u64,

    pub auto_recovery: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            error_rate_threshold: 50.0,
            latency_threshold: Duration::from_secs(5),
            recovery_grace_period: Duration::from_secs(300),
            min_requests: 5,
            auto_recovery: true,
        }
    }
}

/// Override for one cache domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDomainConfig {
    #[serde(with = "duration_str")]
    pub ttl: Duration,

    #[serde(with = "duration_str")]
    pub stale_window: Duration,

    pub max_entries: u64,
}

impl From<CacheDomainConfig> for CachePolicy {
    fn from(config: CacheDomainConfig) -> Self {
        CachePolicy::new(config.ttl, config.stale_window, config.max_entries)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,

    pub domains: BTreeMap<String, CacheDomainConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            domains: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    /// Built-in domain policies with overrides applied.
    pub fn policies(&self) -> BTreeMap<String, CachePolicy> {
        let mut policies: BTreeMap<String, CachePolicy> = CachePolicy::builtin_domains()
            .iter()
            .filter_map(|d| CachePolicy::for_domain(d).map(|p| (d.to_string(), p)))
            .collect();
        for (domain, config) in &self.domains {
            policies.insert(domain.clone(), config.clone().into());
        }
        policies
    }
}

/// Top-level configuration for the integration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub webhook: WebhookConfig,

    #[serde(default = "PartnerConfig::apollo")]
    pub apollo: PartnerConfig,

    #[serde(default = "PartnerConfig::avinode")]
    pub avinode: PartnerConfig,

    pub orchestrator: OrchestratorConfig,
    pub monitor: MonitorConfig,
    pub cache: CacheConfig,

    /// Per-service overrides of the named breaker defaults
    pub circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,

    /// Events retained by the integration logger
    pub log_capacity: Option<usize>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            webhook: WebhookConfig::default(),
            apollo: PartnerConfig::apollo(),
            avinode: PartnerConfig::avinode(),
            orchestrator: OrchestratorConfig::default(),
            monitor: MonitorConfig::default(),
            cache: CacheConfig::default(),
            circuit_breakers: BTreeMap::new(),
            log_capacity: None,
        }
    }
}

impl IntegrationConfig {
    /// Parse from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Apply environment overrides.
    ///
    /// Recognised: `JETLINK_N8N_WEBHOOK_URL`, `JETLINK_APOLLO_BASE_URL`,
    /// `JETLINK_AVINODE_BASE_URL`, `JETLINK_HEALTH_CHECK_INTERVAL`. API keys
    /// are read from the environment at client construction instead.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var("JETLINK_N8N_WEBHOOK_URL") {
            self.webhook.url = url;
        }
        if let Ok(url) = std::env::var("JETLINK_APOLLO_BASE_URL") {
            self.apollo.base_url = url;
        }
        if let Ok(url) = std::env::var("JETLINK_AVINODE_BASE_URL") {
            self.avinode.base_url = url;
        }
        if let Ok(interval) = std::env::var("JETLINK_HEALTH_CHECK_INTERVAL") {
            self.orchestrator.health_check_interval = humantime::parse_duration(&interval)
                .map_err(|e| {
                    ConfigError::Invalid(format!("JETLINK_HEALTH_CHECK_INTERVAL: {}", e))
                })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("webhook.url", &self.webhook.url),
            ("apollo.base_url", &self.apollo.base_url),
            ("avinode.base_url", &self.avinode.base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
        }

        for (service, breaker) in &self.circuit_breakers {
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "circuit_breakers.{}: thresholds must be positive",
                    service
                )));
            }
            if breaker.half_open_max_calls == 0 {
                return Err(ConfigError::Invalid(format!(
                    "circuit_breakers.{}: half_open_max_calls must be positive",
                    service
                )));
            }
        }

        if self.orchestrator.health_check_interval.is_zero()
            || self.monitor.check_interval.is_zero()
            || self.cache.sweep_interval.is_zero()
        {
            return Err(ConfigError::Invalid("intervals must be non-zero".to_string()));
        }

        if !(0.0..=100.0).contains(&self.monitor.error_rate_threshold) {
            return Err(ConfigError::Invalid(
                "monitor.error_rate_threshold must be a percentage".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_is_valid() {
        let config = IntegrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.apollo.timeout, Duration::from_secs(15));
        assert_eq!(config.avinode.timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_parse_humantime_durations() {
        let yaml = r#"
webhook:
  url: https://n8n.example.com/webhook/agent
  timeout: 45s
monitor:
  latency_threshold: 2s 500ms
  recovery_grace_period: 10m
cache:
  sweep_interval: 30
  domains:
    apollo-leads:
      ttl: 20m
      stale_window: 5m
      max_entries: 50
circuit_breakers:
  apollo:
    failure_threshold: 4
    recovery_timeout: 1m
    request_timeout: 10s
    half_open_max_calls: 1
    success_threshold: 1
    monitoring_window: 3m
"#;
        let config = IntegrationConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.webhook.timeout, Duration::from_secs(45));
        assert_eq!(config.monitor.latency_threshold, Duration::from_millis(2500));
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.circuit_breakers["apollo"].failure_threshold, 4);

        let policies = config.cache.policies();
        assert_eq!(policies["apollo-leads"].ttl, Duration::from_secs(1200));
        assert_eq!(policies["apollo-leads"].max_entries, 50);
        assert!(policies.contains_key("avinode-aircraft"));
    }

    #[test]
    fn test_rejects_invalid_url() {
        let yaml = r#"
webhook:
  url: ftp://example.com
"#;
        assert!(matches!(
            IntegrationConfig::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let mut config = IntegrationConfig::default();
        config.circuit_breakers.insert(
            "n8n".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 0,
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_round_trips_as_text() {
        let yaml = serde_yaml::to_string(&OrchestratorConfig::default()).unwrap();
        assert!(yaml.contains("health_check_interval: 30s"));
    }
}
