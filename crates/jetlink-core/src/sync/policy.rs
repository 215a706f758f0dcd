//! Declarative per-data-type sync policies and validation rules.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

lazy_static! {
    static ref EMAIL: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

/// How to pick one value when sources disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    NewestWins,
    PriorityWins,
    Merge,
    Manual,
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictResolution::NewestWins => write!(f, "newest_wins"),
            ConflictResolution::PriorityWins => write!(f, "priority_wins"),
            ConflictResolution::Merge => write!(f, "merge"),
            ConflictResolution::Manual => write!(f, "manual"),
        }
    }
}

/// Predicate used by [`RuleCheck::Custom`]. Receives `Null` for absent fields.
pub type CustomCheck = Arc<dyn Fn(&JsonValue) -> bool + Send + Sync>;

/// The check a [`ValidationRule`] applies.
#[derive(Clone)]
pub enum RuleCheck {
    /// Present, non-null and not an empty string
    Required,

    /// String value must match; absent fields pass
    Format(Regex),

    /// Numeric value within the inclusive bounds; absent fields pass
    Range { min: Option<f64>, max: Option<f64> },

    Custom(CustomCheck),
}

impl fmt::Debug for RuleCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCheck::Required => write!(f, "Required"),
            RuleCheck::Format(re) => f.debug_tuple("Format").field(&re.as_str()).finish(),
            RuleCheck::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            RuleCheck::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

/// One rule applied to one field of a source's result.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub field: String,
    pub check: RuleCheck,
    pub message: String,
}

impl ValidationRule {
    pub fn required(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            message: format!("{} is required", field),
            field,
            check: RuleCheck::Required,
        }
    }

    pub fn format(field: impl Into<String>, pattern: Regex) -> Self {
        let field = field.into();
        Self {
            message: format!("{} has an invalid format", field),
            field,
            check: RuleCheck::Format(pattern),
        }
    }

    pub fn range(field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        let field = field.into();
        Self {
            message: format!("{} is out of range", field),
            field,
            check: RuleCheck::Range { min, max },
        }
    }

    pub fn custom(
        field: impl Into<String>,
        message: impl Into<String>,
        check: impl Fn(&JsonValue) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            field: field.into(),
            check: RuleCheck::Custom(Arc::new(check)),
            message: message.into(),
        }
    }

    /// Apply the rule to a record.
    pub fn check(&self, record: &JsonValue) -> bool {
        let value = record.get(&self.field);
        match (&self.check, value) {
            (RuleCheck::Required, None) | (RuleCheck::Required, Some(JsonValue::Null)) => false,
            (RuleCheck::Required, Some(JsonValue::String(s))) => !s.trim().is_empty(),
            (RuleCheck::Required, Some(_)) => true,

            (RuleCheck::Format(_), None) | (RuleCheck::Format(_), Some(JsonValue::Null)) => true,
            (RuleCheck::Format(re), Some(JsonValue::String(s))) => re.is_match(s),
            (RuleCheck::Format(_), Some(_)) => false,

            (RuleCheck::Range { .. }, None) | (RuleCheck::Range { .. }, Some(JsonValue::Null)) => {
                true
            }
            (RuleCheck::Range { min, max }, Some(v)) => match v.as_f64() {
                Some(n) => min.map_or(true, |m| n >= m) && max.map_or(true, |m| n <= m),
                None => false,
            },

            (RuleCheck::Custom(f), v) => (**f)(v.unwrap_or(&JsonValue::Null)),
        }
    }
}

/// Messages of every rule the record breaks. Empty means valid.
pub fn validate(record: &JsonValue, rules: &[ValidationRule]) -> Vec<String> {
    rules
        .iter()
        .filter(|rule| !rule.check(record))
        .map(|rule| rule.message.clone())
        .collect()
}

/// Sync policy for one data type.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub conflict_resolution: ConflictResolution,

    /// Oldest acceptable cached value for this type
    pub max_age: Duration,

    /// Sources that must all succeed, or the sync fails
    pub required_sources: Vec<String>,

    /// Sources consulted when required ones are unavailable
    pub fallback_sources: Vec<String>,

    pub validation_rules: Vec<ValidationRule>,
}

impl SyncPolicy {
    pub fn new(conflict_resolution: ConflictResolution) -> Self {
        Self {
            conflict_resolution,
            max_age: Duration::from_secs(300),
            required_sources: Vec::new(),
            fallback_sources: Vec::new(),
            validation_rules: Vec::new(),
        }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn require(mut self, source: impl Into<String>) -> Self {
        self.required_sources.push(source.into());
        self
    }

    pub fn fallback(mut self, source: impl Into<String>) -> Self {
        self.fallback_sources.push(source.into());
        self
    }

    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.validation_rules.push(rule);
        self
    }

    /// Built-in policies for the partner data types.
    pub fn defaults() -> Vec<(&'static str, SyncPolicy)> {
        vec![
            (
                "lead",
                SyncPolicy::new(ConflictResolution::PriorityWins)
                    .max_age(Duration::from_secs(15 * 60))
                    .require("apollo")
                    .fallback("n8n")
                    .rule(ValidationRule::required("id"))
                    .rule(ValidationRule::format("email", EMAIL.clone())),
            ),
            (
                "aircraft",
                SyncPolicy::new(ConflictResolution::NewestWins)
                    .max_age(Duration::from_secs(3 * 60))
                    .fallback("n8n")
                    .rule(ValidationRule::required("id"))
                    .rule(ValidationRule::range("capacity", Some(1.0), Some(500.0))),
            ),
            (
                "campaign",
                SyncPolicy::new(ConflictResolution::Merge)
                    .max_age(Duration::from_secs(10 * 60))
                    .rule(ValidationRule::required("id")),
            ),
            (
                "trip",
                SyncPolicy::new(ConflictResolution::Manual)
                    .max_age(Duration::from_secs(5 * 60))
                    .rule(ValidationRule::required("id")),
            ),
        ]
    }
}
