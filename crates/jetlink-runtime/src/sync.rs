//! Cross-source data reconciliation.
//!
//! When several sources can answer for the same record, [`DataSyncManager`]
//! fetches from all of them concurrently, drops failed and invalid results,
//! detects field-level conflicts and resolves them under the data type's
//! [`SyncPolicy`]. The resolved record and every source's raw result are
//! cached for later fallback use.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use jetlink_core::sync::{build_record, detect_conflicts, resolve_conflict, validate};
use jetlink_core::{
    ConflictResolution, DataConflict, DataSource, IntegrationError, SourceResult, SyncError,
    SyncPolicy,
};

use crate::cache::{CacheHit, MultiTierCacheManager, SetOptions};
use crate::logger::IntegrationLogger;

const COMPONENT: &str = "data_sync";
const HISTORY_LIMIT: usize = 1000;
const HISTORY_KEEP: usize = 500;

/// One source's fetch, tagged with the source id.
pub type SourceFetch<'a> = (String, BoxFuture<'a, Result<JsonValue, IntegrationError>>);

/// Tag a fetch future with its source id.
pub fn fetch<'a, F>(source: impl Into<String>, future: F) -> SourceFetch<'a>
where
    F: Future<Output = Result<JsonValue, IntegrationError>> + Send + 'a,
{
    (source.into(), future.boxed())
}

/// Cache domain holding records of `data_type`.
pub fn cache_domain_for(data_type: &str) -> String {
    match data_type {
        "lead" => "apollo-leads".to_string(),
        "campaign" => "apollo-campaigns".to_string(),
        "aircraft" => "avinode-aircraft".to_string(),
        "trip" => "avinode-trips".to_string(),
        other => format!("sync-{}", other),
    }
}

/// Result of one sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub data_type: String,
    pub key: String,
    pub record: JsonValue,

    /// Sources whose results made it into the record, in fetch order
    pub sources: Vec<String>,

    /// Source id to error message
    pub failed: BTreeMap<String, String>,

    /// Source id to failed validation messages
    pub invalid: BTreeMap<String, Vec<String>>,

    pub conflicts: Vec<DataConflict>,
    pub synced_at: DateTime<Utc>,
}

impl SyncOutcome {
    pub fn has_pending_conflicts(&self) -> bool {
        self.conflicts.iter().any(DataConflict::is_pending)
    }
}

/// Fetch results split by fate.
struct Collected {
    valid: Vec<SourceResult>,
    failed: BTreeMap<String, String>,
    invalid: BTreeMap<String, Vec<String>>,
}

pub struct DataSyncManager {
    sources: RwLock<BTreeMap<String, DataSource>>,
    policies: RwLock<BTreeMap<String, SyncPolicy>>,
    caches: Arc<MultiTierCacheManager>,
    logger: Arc<IntegrationLogger>,
    history: Mutex<Vec<DataConflict>>,
}

impl DataSyncManager {
    /// Create with the built-in policies for `lead`, `aircraft`, `campaign` and `trip`.
    pub fn new(caches: Arc<MultiTierCacheManager>, logger: Arc<IntegrationLogger>) -> Self {
        let policies = SyncPolicy::defaults()
            .into_iter()
            .map(|(name, policy)| (name.to_string(), policy))
            .collect();
        Self {
            sources: RwLock::new(BTreeMap::new()),
            policies: RwLock::new(policies),
            caches,
            logger,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn register_source(&self, source: DataSource) {
        tracing::debug!(source = %source.id, priority = source.priority, "Data source registered");
        self.sources.write().insert(source.id.clone(), source);
    }

    pub fn sources(&self) -> Vec<DataSource> {
        self.sources.read().values().cloned().collect()
    }

    /// Mark a registered source up or down. Down sources are not fetched.
    pub fn set_source_availability(&self, source: &str, available: bool) -> bool {
        match self.sources.write().get_mut(source) {
            Some(entry) => {
                entry.is_available = available;
                true
            }
            None => false,
        }
    }

    pub fn set_policy(&self, data_type: impl Into<String>, policy: SyncPolicy) {
        self.policies.write().insert(data_type.into(), policy);
    }

    pub fn policy(&self, data_type: &str) -> Option<SyncPolicy> {
        self.policies.read().get(data_type).cloned()
    }

    /// Fetch from every source, reconcile and cache the record.
    pub async fn sync_data(
        &self,
        data_type: &str,
        key: &str,
        fetchers: Vec<SourceFetch<'_>>,
    ) -> Result<SyncOutcome, SyncError> {
        let policy = self
            .policy(data_type)
            .ok_or_else(|| SyncError::UnknownPolicy(data_type.to_string()))?;

        let collected = self.collect(&policy, fetchers).await;

        let missing: Vec<String> = policy
            .required_sources
            .iter()
            .filter(|required| {
                !collected.valid.iter().any(|r| &r.source == *required)
                    && !collected.invalid.contains_key(*required)
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.logger.error(
                COMPONENT,
                "sync.missing_required",
                None,
                json!({ "data_type": data_type, "key": key, "missing": missing }),
            );
            return Err(SyncError::MissingRequiredSources {
                data_type: data_type.to_string(),
                missing,
            });
        }

        if collected.valid.is_empty() {
            return Err(SyncError::NoValidSources {
                data_type: data_type.to_string(),
                key: key.to_string(),
            });
        }

        if collected
            .valid
            .iter()
            .all(|r| policy.fallback_sources.contains(&r.source))
        {
            tracing::warn!(data_type = %data_type, key = %key, "Only fallback sources answered");
        }

        let priorities: BTreeMap<String, u32> = self
            .sources
            .read()
            .values()
            .map(|s| (s.id.clone(), s.priority))
            .collect();

        let mut conflicts = detect_conflicts(&collected.valid, policy.conflict_resolution);
        for conflict in &mut conflicts {
            resolve_conflict(conflict, &priorities);
            if conflict.is_pending() {
                self.logger.warn(
                    COMPONENT,
                    "sync.manual_conflict",
                    None,
                    json!({
                        "data_type": data_type,
                        "key": key,
                        "field": conflict.field,
                        "provisional": conflict.provisional_value(),
                    }),
                );
            }
        }

        let record = build_record(&collected.valid, &conflicts);
        self.write_cache(data_type, key, &policy, &record, &collected.valid).await;

        let synced_at = Utc::now();
        {
            let mut sources = self.sources.write();
            for result in &collected.valid {
                if let Some(source) = sources.get_mut(&result.source) {
                    source.last_sync = Some(synced_at);
                }
            }
        }
        self.record_history(&conflicts);

        self.logger.info(
            COMPONENT,
            "sync.completed",
            None,
            json!({
                "data_type": data_type,
                "key": key,
                "sources": collected.valid.len(),
                "failed": collected.failed.len(),
                "invalid": collected.invalid.len(),
                "conflicts": conflicts.len(),
            }),
        );

        Ok(SyncOutcome {
            data_type: data_type.to_string(),
            key: key.to_string(),
            record,
            sources: collected.valid.iter().map(|r| r.source.clone()).collect(),
            failed: collected.failed,
            invalid: collected.invalid,
            conflicts,
            synced_at,
        })
    }

    /// Fetch and report conflicts without resolving, caching or recording them.
    pub async fn check_consistency(
        &self,
        data_type: &str,
        fetchers: Vec<SourceFetch<'_>>,
    ) -> Result<Vec<DataConflict>, SyncError> {
        let policy = self
            .policy(data_type)
            .ok_or_else(|| SyncError::UnknownPolicy(data_type.to_string()))?;
        let collected = self.collect(&policy, fetchers).await;
        Ok(detect_conflicts(&collected.valid, policy.conflict_resolution))
    }

    /// The last reconciled record for `key`, if still cached.
    pub async fn cached_record(&self, data_type: &str, key: &str) -> Option<CacheHit<JsonValue>> {
        self.caches.domain(&cache_domain_for(data_type)).get(key).await
    }

    /// Run every available source's fetch concurrently and validate the results.
    async fn collect(&self, policy: &SyncPolicy, fetchers: Vec<SourceFetch<'_>>) -> Collected {
        let down: Vec<String> = self
            .sources
            .read()
            .values()
            .filter(|s| !s.is_available)
            .map(|s| s.id.clone())
            .collect();

        let mut failed = BTreeMap::new();
        let mut pending = Vec::with_capacity(fetchers.len());
        for (source, future) in fetchers {
            if down.contains(&source) {
                failed.insert(source, "source marked unavailable".to_string());
                continue;
            }
            pending.push(async move {
                let outcome = future.await;
                (source, outcome, Utc::now())
            });
        }

        let mut valid = Vec::new();
        let mut invalid = BTreeMap::new();
        for (source, outcome, timestamp) in join_all(pending).await {
            match outcome {
                Ok(data) => {
                    let errors = validate(&data, &policy.validation_rules);
                    if errors.is_empty() {
                        valid.push(SourceResult {
                            source,
                            data,
                            timestamp,
                        });
                    } else {
                        tracing::warn!(source = %source, errors = ?errors, "Source result failed validation");
                        invalid.insert(source, errors);
                    }
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "Source fetch failed");
                    failed.insert(source, e.to_string());
                }
            }
        }

        Collected {
            valid,
            failed,
            invalid,
        }
    }

    async fn write_cache(
        &self,
        data_type: &str,
        key: &str,
        policy: &SyncPolicy,
        record: &JsonValue,
        results: &[SourceResult],
    ) {
        let cache = self.caches.domain(&cache_domain_for(data_type));
        let sources: Vec<&str> = results.iter().map(|r| r.source.as_str()).collect();

        let options = SetOptions {
            ttl: Some(policy.max_age),
            version: None,
            metadata: BTreeMap::from([("sources".to_string(), json!(sources))]),
        };
        cache.set(key, record.clone(), "sync", options).await;

        for result in results {
            cache
                .set(
                    format!("{}:{}", key, result.source),
                    result.data.clone(),
                    &result.source,
                    SetOptions::ttl(policy.max_age),
                )
                .await;
        }
    }

    fn record_history(&self, conflicts: &[DataConflict]) {
        if conflicts.is_empty() {
            return;
        }
        let mut history = self.history.lock();
        history.extend(conflicts.iter().cloned());
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_KEEP;
            history.drain(..excess);
        }
    }

    /// Every recorded conflict, oldest first.
    pub fn conflict_history(&self) -> Vec<DataConflict> {
        self.history.lock().clone()
    }

    /// Manual conflicts awaiting an operator, with their history index.
    pub fn pending_conflicts(&self) -> Vec<(usize, DataConflict)> {
        self.history
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_pending())
            .map(|(i, c)| (i, c.clone()))
            .collect()
    }

    /// Settle a conflict by history index.
    ///
    /// Indices shift when the history is trimmed; take them from a fresh
    /// [`pending_conflicts`](Self::pending_conflicts) call.
    pub fn resolve_conflict(&self, index: usize, value: JsonValue, by: &str) -> Result<(), SyncError> {
        let mut history = self.history.lock();
        let conflict = history.get_mut(index).ok_or(SyncError::UnknownConflict(index))?;
        conflict.resolved_value = Some(value);
        conflict.resolved_by = Some(by.to_string());
        if conflict.resolution != ConflictResolution::Manual {
            tracing::info!(field = %conflict.field, by = %by, "Overriding automatic conflict resolution");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jetlink_core::ValidationRule;

    fn manager() -> DataSyncManager {
        DataSyncManager::new(
            Arc::new(MultiTierCacheManager::with_builtin_domains()),
            Arc::new(IntegrationLogger::default()),
        )
    }

    fn ok(source: &str, data: JsonValue) -> SourceFetch<'static> {
        fetch(source, async move { Ok(data) })
    }

    fn failing(source: &str) -> SourceFetch<'static> {
        let service = source.to_string();
        fetch(source, async move {
            Err(IntegrationError::TransientNetwork {
                service,
                message: "connection reset".into(),
            })
        })
    }

    #[tokio::test]
    async fn test_priority_wins_name_conflict() {
        let sync = manager();
        sync.register_source(DataSource::new("A", "Source A", 1));
        sync.register_source(DataSource::new("B", "Source B", 2));
        sync.set_policy("profile", SyncPolicy::new(ConflictResolution::PriorityWins));

        let outcome = sync
            .sync_data(
                "profile",
                "profile:1",
                vec![ok("A", json!({"id": 1, "name": "A"})), ok("B", json!({"id": 1, "name": "B"}))],
            )
            .await
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].field, "name");
        assert_eq!(outcome.record, json!({"id": 1, "name": "B"}));
        assert_eq!(outcome.sources, vec!["A", "B"]);

        let cached = sync.cached_record("profile", "profile:1").await.unwrap();
        assert_eq!(cached.data(), json!({"id": 1, "name": "B"}));
        let raw = sync.caches.domain("sync-profile").get("profile:1:A").await.unwrap();
        assert_eq!(raw.data(), json!({"id": 1, "name": "A"}));

        assert!(sync.sources().iter().all(|s| s.last_sync.is_some()));
        assert_eq!(sync.conflict_history().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_required_source_fails_sync() {
        let sync = manager();
        let err = sync
            .sync_data(
                "lead",
                "lead:42",
                vec![failing("apollo"), ok("n8n", json!({"id": 42, "email": "a@b.co"}))],
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SyncError::MissingRequiredSources {
                data_type: "lead".into(),
                missing: vec!["apollo".into()],
            }
        );
        assert!(sync.cached_record("lead", "lead:42").await.is_none());
    }

    #[tokio::test]
    async fn test_failure_in_one_source_does_not_cancel_others() {
        let sync = manager();
        let outcome = sync
            .sync_data(
                "campaign",
                "campaign:7",
                vec![failing("n8n"), ok("apollo", json!({"id": 7, "name": "Q3"}))],
            )
            .await
            .unwrap();

        assert_eq!(outcome.record, json!({"id": 7, "name": "Q3"}));
        assert!(outcome.failed["n8n"].contains("connection reset"));
    }

    #[tokio::test]
    async fn test_invalid_results_excluded() {
        let sync = manager();
        let outcome = sync
            .sync_data(
                "aircraft",
                "tail:N123",
                vec![
                    ok("avinode", json!({"id": "N123", "capacity": 900})),
                    ok("n8n", json!({"id": "N123", "capacity": 8})),
                ],
            )
            .await
            .unwrap();

        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.record["capacity"], json!(8));
        assert_eq!(outcome.invalid["avinode"].len(), 1);
    }

    #[tokio::test]
    async fn test_no_valid_sources() {
        let sync = manager();
        let err = sync
            .sync_data("trip", "trip:1", vec![ok("avinode", json!({"name": "no id"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoValidSources { .. }));
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let sync = manager();
        let err = sync.sync_data("yacht", "y:1", vec![]).await.unwrap_err();
        assert_eq!(err, SyncError::UnknownPolicy("yacht".into()));
    }

    #[tokio::test]
    async fn test_manual_conflicts_stay_pending_until_resolved() {
        let sync = manager();
        let outcome = sync
            .sync_data(
                "trip",
                "trip:9",
                vec![
                    ok("avinode", json!({"id": 9, "status": "quoted"})),
                    ok("n8n", json!({"id": 9, "status": "booked"})),
                ],
            )
            .await
            .unwrap();

        assert!(outcome.has_pending_conflicts());
        assert_eq!(outcome.record["status"], json!("quoted"));

        let pending = sync.pending_conflicts();
        assert_eq!(pending.len(), 1);
        let (index, conflict) = &pending[0];
        assert_eq!(conflict.field, "status");

        sync.resolve_conflict(*index, json!("booked"), "ops").unwrap();
        assert!(sync.pending_conflicts().is_empty());
        assert_eq!(sync.conflict_history()[*index].resolved_by.as_deref(), Some("ops"));
        assert_eq!(sync.resolve_conflict(99, json!(null), "ops"), Err(SyncError::UnknownConflict(99)));
    }

    #[tokio::test]
    async fn test_merge_concatenates_arrays() {
        let sync = manager();
        let outcome = sync
            .sync_data(
                "campaign",
                "campaign:1",
                vec![
                    ok("apollo", json!({"id": 1, "tags": ["vip", "q3"]})),
                    ok("n8n", json!({"id": 1, "tags": ["q3", "west"]})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.record["tags"], json!(["vip", "q3", "west"]));
        assert_eq!(outcome.conflicts[0].resolved_by.as_deref(), Some("merge"));
    }

    #[tokio::test]
    async fn test_check_consistency_is_read_only() {
        let sync = manager();
        let conflicts = sync
            .check_consistency(
                "aircraft",
                vec![
                    ok("avinode", json!({"id": "N1", "capacity": 6})),
                    ok("n8n", json!({"id": "N1", "capacity": 8})),
                ],
            )
            .await
            .unwrap();

        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].resolved_value.is_none());
        assert!(sync.conflict_history().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_source_is_skipped() {
        let sync = manager();
        sync.register_source(DataSource::new("n8n", "Workflow", 1));
        assert!(sync.set_source_availability("n8n", false));
        assert!(!sync.set_source_availability("unknown", false));

        sync.set_policy(
            "profile",
            SyncPolicy::new(ConflictResolution::NewestWins).rule(ValidationRule::required("id")),
        );
        let outcome = sync
            .sync_data(
                "profile",
                "p:1",
                vec![ok("n8n", json!({"id": 1, "name": "X"})), ok("crm", json!({"id": 1, "name": "Y"}))],
            )
            .await
            .unwrap();

        assert_eq!(outcome.sources, vec!["crm"]);
        assert!(outcome.failed.contains_key("n8n"));
    }

    #[test]
    fn test_history_is_trimmed() {
        let sync = manager();
        let conflict = detect_conflicts(
            &[
                SourceResult {
                    source: "a".into(),
                    data: json!({"x": 1}),
                    timestamp: Utc::now(),
                },
                SourceResult {
                    source: "b".into(),
                    data: json!({"x": 2}),
                    timestamp: Utc::now(),
                },
            ],
            ConflictResolution::Manual,
        );

        for _ in 0..HISTORY_LIMIT {
            sync.record_history(&conflict);
        }
        assert_eq!(sync.conflict_history().len(), HISTORY_LIMIT);

        sync.record_history(&conflict);
        assert_eq!(sync.conflict_history().len(), HISTORY_KEEP);
    }

    #[test]
    fn test_cache_domains() {
        assert_eq!(cache_domain_for("lead"), "apollo-leads");
        assert_eq!(cache_domain_for("trip"), "avinode-trips");
        assert_eq!(cache_domain_for("profile"), "sync-profile");
    }
}
