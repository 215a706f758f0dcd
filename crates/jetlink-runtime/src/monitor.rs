//! Health monitoring and alerting over the circuit-breaker registry.
//!
//! [`ServiceMonitor`] runs independently of the request path. Each pass
//! snapshots every breaker and raises deduplicated alerts for high error
//! rates, slow responses and long outages. Error rates are judged over each
//! breaker's monitoring window. Breakers that stayed open past the recovery
//! grace period are reset. Warnings resolve once their condition clears, and
//! outage alerts resolve with a recovery notice once the service comes back.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

use jetlink_core::{
    AlertCondition, AlertLevel, CircuitState, OverallHealth, ServiceAlert, ServiceHealth,
};

use crate::config::MonitorConfig;
use crate::logger::IntegrationLogger;
use crate::resilience::CircuitBreakerManager;

const COMPONENT: &str = "monitor";
const ALERT_HISTORY_LIMIT: usize = 1000;
const ALERT_HISTORY_KEEP: usize = 500;

/// Snapshot returned by [`ServiceMonitor::health_report`].
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub generated_at: DateTime<Utc>,
    pub system_health: OverallHealth,
    pub services: Vec<ServiceHealth>,
    pub open_circuits: Vec<String>,
    pub active_alerts: Vec<ServiceAlert>,
    pub total_alerts: usize,
    pub last_check: Option<DateTime<Utc>>,
}

pub struct ServiceMonitor {
    breakers: Arc<CircuitBreakerManager>,
    logger: Arc<IntegrationLogger>,
    config: MonitorConfig,
    alerts: Mutex<Vec<ServiceAlert>>,
    last_check: Mutex<Option<DateTime<Utc>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceMonitor {
    pub fn new(
        breakers: Arc<CircuitBreakerManager>,
        logger: Arc<IntegrationLogger>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            breakers,
            logger,
            config,
            alerts: Mutex::new(Vec::new()),
            last_check: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start the periodic check loop. Restarting replaces the running loop.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.check_now();
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!(interval = ?interval, "Service monitor started");
    }

    /// Stop the check loop. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            tracing::info!("Service monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Run one monitoring pass. Returns the alerts it raised.
    pub fn check_now(&self) -> Vec<ServiceAlert> {
        let mut raised = Vec::new();

        for service in self.breakers.service_names() {
            let breaker = self.breakers.get(&service);
            let health = breaker.health();

            if health.state != CircuitState::Open {
                self.resolve_outage(&service, &mut raised);
            }

            let error_rate = health.window_error_rate();
            if error_rate <= self.config.error_rate_threshold {
                self.resolve_condition(&service, AlertCondition::HighErrorRate);
            } else if health.window_requests >= self.config.min_requests {
                let alert = ServiceAlert::new(
                    &service,
                    AlertLevel::Warning,
                    AlertCondition::HighErrorRate,
                    format!("{} error rate is {:.1}%", service, error_rate),
                )
                .with_metadata("error_rate", json!(error_rate))
                .with_metadata("window_requests", json!(health.window_requests))
                .with_metadata("threshold", json!(self.config.error_rate_threshold));
                self.raise_unique(alert, &mut raised);
            }

            let latency_ms = self.config.latency_threshold.as_secs_f64() * 1000.0;
            if health.average_response_time_ms <= latency_ms {
                self.resolve_condition(&service, AlertCondition::HighLatency);
            } else {
                let alert = ServiceAlert::new(
                    &service,
                    AlertLevel::Warning,
                    AlertCondition::HighLatency,
                    format!(
                        "{} average response time is {:.0}ms",
                        service, health.average_response_time_ms
                    ),
                )
                .with_metadata("average_response_time_ms", json!(health.average_response_time_ms))
                .with_metadata("threshold_ms", json!(latency_ms));
                self.raise_unique(alert, &mut raised);
            }

            let Some(open_for) = breaker.open_duration() else {
                continue;
            };
            if open_for <= self.config.recovery_grace_period {
                continue;
            }

            let alert = ServiceAlert::new(
                &service,
                AlertLevel::Critical,
                AlertCondition::ServiceDown,
                format!(
                    "{} has been unavailable for {}",
                    service,
                    humantime::format_duration(std::time::Duration::from_secs(open_for.as_secs()))
                ),
            )
            .with_metadata("open_secs", json!(open_for.as_secs()));
            self.raise_unique(alert, &mut raised);

            if self.config.auto_recovery {
                breaker.reset();
                self.logger.warn(
                    COMPONENT,
                    "monitor.auto_recovery",
                    None,
                    json!({ "service": service, "open_secs": open_for.as_secs() }),
                );
            }
        }

        *self.last_check.lock() = Some(Utc::now());
        raised
    }

    /// Resolve every open alert for `condition` on `service`. True if any was open.
    fn resolve_condition(&self, service: &str, condition: AlertCondition) -> bool {
        let resolved: Vec<String> = self
            .alerts
            .lock()
            .iter_mut()
            .filter(|a| a.covers(service, condition))
            .filter_map(|a| a.resolve().then(|| a.id.clone()))
            .collect();

        for id in &resolved {
            self.logger.info(
                COMPONENT,
                "alert.resolved",
                None,
                json!({ "id": id, "service": service, "condition": condition }),
            );
        }
        !resolved.is_empty()
    }

    /// Resolve an outstanding outage alert for `service` and announce recovery.
    fn resolve_outage(&self, service: &str, raised: &mut Vec<ServiceAlert>) {
        if self.resolve_condition(service, AlertCondition::ServiceDown) {
            let alert = ServiceAlert::new(
                service,
                AlertLevel::Info,
                AlertCondition::Recovered,
                format!("{} has recovered", service),
            );
            raised.push(self.push(alert));
        }
    }

    /// Raise `alert` unless an unresolved one already covers its condition.
    fn raise_unique(&self, alert: ServiceAlert, raised: &mut Vec<ServiceAlert>) {
        let duplicate = self
            .alerts
            .lock()
            .iter()
            .any(|a| a.covers(&alert.service_name, alert.condition));
        if !duplicate {
            raised.push(self.push(alert));
        }
    }

    fn push(&self, alert: ServiceAlert) -> ServiceAlert {
        let data = json!({
            "id": alert.id,
            "service": alert.service_name,
            "level": alert.level,
            "condition": alert.condition,
            "message": alert.message,
        });
        match alert.level {
            AlertLevel::Critical => self.logger.error(COMPONENT, "alert.raised", None, data),
            AlertLevel::Warning => self.logger.warn(COMPONENT, "alert.raised", None, data),
            AlertLevel::Info => self.logger.info(COMPONENT, "alert.raised", None, data),
        }

        let mut alerts = self.alerts.lock();
        alerts.push(alert.clone());
        if alerts.len() > ALERT_HISTORY_LIMIT {
            let excess = alerts.len() - ALERT_HISTORY_KEEP;
            alerts.drain(..excess);
        }
        alert
    }

    /// Raise an operator alert. Manual alerts are never deduplicated.
    pub fn create_alert(
        &self,
        service: &str,
        level: AlertLevel,
        message: &str,
        metadata: BTreeMap<String, JsonValue>,
    ) -> ServiceAlert {
        let mut alert = ServiceAlert::new(service, level, AlertCondition::Manual, message);
        alert.metadata = metadata;
        self.push(alert)
    }

    /// Resolve by id. False if unknown or already resolved.
    pub fn resolve_alert(&self, id: &str) -> bool {
        let resolved = self
            .alerts
            .lock()
            .iter_mut()
            .find(|a| a.id == id)
            .map_or(false, ServiceAlert::resolve);
        if resolved {
            self.logger
                .info(COMPONENT, "alert.resolved", None, json!({ "id": id }));
        }
        resolved
    }

    pub fn active_alerts(&self) -> Vec<ServiceAlert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Full alert history, oldest first.
    pub fn alerts(&self) -> Vec<ServiceAlert> {
        self.alerts.lock().clone()
    }

    /// Critical when no circuit is closed, degraded when some are.
    pub fn system_health(&self) -> OverallHealth {
        let health = self.breakers.all_health();
        let closed = health
            .iter()
            .filter(|h| h.state == CircuitState::Closed)
            .count();
        OverallHealth::classify(closed, health.len())
    }

    pub fn health_report(&self) -> MonitorReport {
        let services = self.breakers.all_health();
        let closed = services
            .iter()
            .filter(|h| h.state == CircuitState::Closed)
            .count();
        let total_alerts = self.alerts.lock().len();

        MonitorReport {
            generated_at: Utc::now(),
            system_health: OverallHealth::classify(closed, services.len()),
            open_circuits: self.breakers.open_services(),
            services,
            active_alerts: self.active_alerts(),
            total_alerts,
            last_check: *self.last_check.lock(),
        }
    }
}

impl Drop for ServiceMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
