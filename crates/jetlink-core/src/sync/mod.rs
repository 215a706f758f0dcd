//! Cross-source data reconciliation: policies, validation and conflicts.

mod conflict;
mod policy;

pub use conflict::{
    build_record, detect_conflicts, merge_values, resolve_conflict, ConflictValue, DataConflict,
    DataSource, SourceResult, WHOLE_VALUE_FIELD,
};
pub use policy::{
    validate, ConflictResolution, CustomCheck, RuleCheck, SyncPolicy, ValidationRule,
};
