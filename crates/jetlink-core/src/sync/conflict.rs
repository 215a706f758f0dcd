//! Conflict detection and resolution across source results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::policy::ConflictResolution;

/// A data source that can answer sync queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub name: String,

    /// Higher wins under `priority_wins`
    pub priority: u32,

    pub last_sync: Option<DateTime<Utc>>,
    pub is_available: bool,
    pub version: String,
}

impl DataSource {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            last_sync: None,
            is_available: true,
            version: "1.0".to_string(),
        }
    }
}

/// One source's successful answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResult {
    pub source: String,
    pub data: JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// One source's value for a conflicting field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictValue {
    pub source: String,
    pub value: JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// A field whose value differs between sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConflict {
    pub field: String,
    pub sources: Vec<ConflictValue>,
    pub resolution: ConflictResolution,

    /// `None` while pending manual resolution
    pub resolved_value: Option<JsonValue>,

    /// Winning source id, `"merge"`, or the operator who resolved it
    pub resolved_by: Option<String>,

    pub detected_at: DateTime<Utc>,
}

impl DataConflict {
    pub fn is_pending(&self) -> bool {
        self.resolved_value.is_none()
    }

    /// Value to use until an operator decides: the first source's.
    pub fn provisional_value(&self) -> JsonValue {
        self.sources
            .first()
            .map(|s| s.value.clone())
            .unwrap_or(JsonValue::Null)
    }
}

/// Field name used when a source answers with a non-object value.
pub const WHOLE_VALUE_FIELD: &str = "value";

fn fields_of(data: &JsonValue) -> Vec<(String, JsonValue)> {
    match data {
        JsonValue::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        other => vec![(WHOLE_VALUE_FIELD.to_string(), other.clone())],
    }
}

/// Find every field whose serialized value differs between sources.
///
/// Fields are the union across all results. A source that does not carry a
/// field does not take part in that field's comparison. Conflicts come back
/// sorted by field name; each keeps the sources in input order.
pub fn detect_conflicts(
    results: &[SourceResult],
    resolution: ConflictResolution,
) -> Vec<DataConflict> {
    let mut by_field: BTreeMap<String, Vec<ConflictValue>> = BTreeMap::new();
    for result in results {
        for (field, value) in fields_of(&result.data) {
            by_field.entry(field).or_default().push(ConflictValue {
                source: result.source.clone(),
                value,
                timestamp: result.timestamp,
            });
        }
    }

    by_field
        .into_iter()
        .filter(|(_, values)| {
            values
                .iter()
                .map(|v| v.value.to_string())
                .collect::<BTreeSet<_>>()
                .len()
                > 1
        })
        .map(|(field, sources)| DataConflict {
            field,
            sources,
            resolution,
            resolved_value: None,
            resolved_by: None,
            detected_at: Utc::now(),
        })
        .collect()
}

/// Resolve a conflict in place under its strategy.
///
/// `priorities` maps source id to registered priority; unregistered sources
/// rank lowest. `Manual` leaves the conflict pending.
pub fn resolve_conflict(conflict: &mut DataConflict, priorities: &BTreeMap<String, u32>) {
    let winner = match conflict.resolution {
        ConflictResolution::NewestWins => {
            // Earliest source wins ties
            let mut best: Option<&ConflictValue> = None;
            for candidate in &conflict.sources {
                if best.map_or(true, |b| candidate.timestamp > b.timestamp) {
                    best = Some(candidate);
                }
            }
            best.map(|b| (b.value.clone(), b.source.clone()))
        }
        ConflictResolution::PriorityWins => {
            let mut best: Option<(&ConflictValue, u32)> = None;
            for candidate in &conflict.sources {
                let priority = priorities.get(&candidate.source).copied().unwrap_or(0);
                if best.map_or(true, |(_, p)| priority > p) {
                    best = Some((candidate, priority));
                }
            }
            best.map(|(b, _)| (b.value.clone(), b.source.clone()))
        }
        ConflictResolution::Merge => {
            let values: Vec<&JsonValue> = conflict.sources.iter().map(|s| &s.value).collect();
            Some((merge_values(&values), "merge".to_string()))
        }
        ConflictResolution::Manual => None,
    };

    if let Some((value, by)) = winner {
        conflict.resolved_value = Some(value);
        conflict.resolved_by = Some(by);
    }
}

/// Merge values for one field, in source order.
///
/// Objects are shallow-merged with later keys overwriting earlier ones.
/// Arrays are concatenated then deduplicated by serialized form. Anything
/// else, including mixed kinds, takes the first value.
pub fn merge_values(values: &[&JsonValue]) -> JsonValue {
    if values.is_empty() {
        return JsonValue::Null;
    }

    if values.iter().all(|v| v.is_object()) {
        let mut merged = Map::new();
        for value in values {
            if let JsonValue::Object(map) = value {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        return JsonValue::Object(merged);
    }

    if values.iter().all(|v| v.is_array()) {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for value in values {
            if let JsonValue::Array(items) = value {
                for item in items {
                    if seen.insert(item.to_string()) {
                        merged.push(item.clone());
                    }
                }
            }
        }
        return JsonValue::Array(merged);
    }

    values[0].clone()
}

/// Build the authoritative record from source results and their conflicts.
///
/// Non-conflicting fields take the first source's value; conflicting fields
/// take the resolved value, or the provisional one while pending. Results
/// with non-object data yield the resolved whole value.
pub fn build_record(results: &[SourceResult], conflicts: &[DataConflict]) -> JsonValue {
    let resolved: BTreeMap<&str, JsonValue> = conflicts
        .iter()
        .map(|c| {
            let value = c.resolved_value.clone().unwrap_or_else(|| c.provisional_value());
            (c.field.as_str(), value)
        })
        .collect();

    if !results.iter().all(|r| r.data.is_object()) {
        return resolved
            .get(WHOLE_VALUE_FIELD)
            .cloned()
            .or_else(|| results.first().map(|r| r.data.clone()))
            .unwrap_or(JsonValue::Null);
    }

    let mut record = Map::new();
    for result in results {
        if let JsonValue::Object(map) = &result.data {
            for (k, v) in map {
                if !record.contains_key(k) {
                    record.insert(k.clone(), v.clone());
                }
            }
        }
    }
    for (field, value) in resolved {
        record.insert(field.to_string(), value);
    }

    JsonValue::Object(record)
}
