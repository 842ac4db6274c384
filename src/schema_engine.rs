//! Schema inference, diffing, and the approval decision table.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::models::{DataSchema, FieldDef, FieldType};

/// How many rows inference looks at by default.
pub const INFERENCE_SAMPLE_SIZE: usize = 100;

/// Outcome of schema validation for a pending import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDecision {
    /// Continue the pipeline; create a new version if the diff is non-empty.
    AutoApprove,
    /// Suspend the pipeline until a reviewer approves or rejects.
    AwaitApproval,
}

/// Difference between the approved schema and a freshly inferred one.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    pub added: BTreeMap<String, FieldDef>,
    pub removed: Vec<String>,
    /// (field, previously approved type, newly observed type).
    pub retyped: Vec<(String, FieldType, FieldType)>,
    breaking: bool,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.retyped.is_empty()
    }

    pub fn is_breaking(&self) -> bool {
        self.breaking
    }

    /// Human-readable change list, persisted on the ImportJob for reviewers.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (name, def) in &self.added {
            lines.push(format!(
                "added field '{}' ({:?}{})",
                name,
                def.field_type,
                if def.required { ", required" } else { "" }
            ));
        }
        for name in &self.removed {
            lines.push(format!("removed field '{}'", name));
        }
        for (name, from, to) in &self.retyped {
            lines.push(format!("field '{}' changed type {:?} -> {:?}", name, from, to));
        }
        lines
    }
}

/// Infer a schema from up to `sample` parsed rows. A field is required when
/// it is present in every sampled row; conflicting observed types collapse
/// to [`FieldType::Mixed`].
pub fn infer_schema(rows: &[Map<String, Value>], sample: usize) -> DataSchema {
    let sampled = &rows[..rows.len().min(sample.max(1))];
    let mut observed: BTreeMap<String, (FieldType, usize)> = BTreeMap::new();

    for row in sampled {
        for (field, value) in row {
            let observed_type = infer_value_type(value);
            observed
                .entry(field.clone())
                .and_modify(|(ty, count)| {
                    if *ty != observed_type {
                        *ty = FieldType::Mixed;
                    }
                    *count += 1;
                })
                .or_insert((observed_type, 1));
        }
    }

    let total = sampled.len();
    let fields = observed
        .into_iter()
        .map(|(name, (field_type, count))| {
            (
                name,
                FieldDef {
                    field_type,
                    required: total > 0 && count == total,
                },
            )
        })
        .collect();

    DataSchema { fields }
}

/// Classify one JSON value. Strings are probed for numeric, boolean, and
/// date shapes so CSV input (all strings on the wire) types sensibly.
fn infer_value_type(value: &Value) -> FieldType {
    match value {
        Value::Bool(_) => FieldType::Boolean,
        Value::Number(_) => FieldType::Number,
        Value::String(s) => {
            if looks_like_date(s) {
                FieldType::Date
            } else if s.parse::<f64>().is_ok() {
                FieldType::Number
            } else if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") {
                FieldType::Boolean
            } else {
                FieldType::String
            }
        }
        _ => FieldType::Mixed,
    }
}

/// Recognize ISO dates/datetimes and US-style slash dates.
pub(crate) fn looks_like_date(s: &str) -> bool {
    let s = s.trim();
    if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%m/%d/%Y").is_ok()
    {
        return true;
    }
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
}

/// Diff the approved schema against a newly inferred one.
///
/// Added fields are non-breaking unless required; removed or retyped fields
/// are breaking. A first import (empty approved schema) is never breaking.
pub fn diff_schemas(current: &DataSchema, inferred: &DataSchema) -> SchemaDiff {
    let mut diff = SchemaDiff::default();
    let first_import = current.fields.is_empty();

    for (name, def) in &inferred.fields {
        match current.fields.get(name) {
            None => {
                diff.added.insert(name.clone(), def.clone());
            }
            Some(existing) if existing.field_type != def.field_type => {
                diff.retyped
                    .push((name.clone(), existing.field_type, def.field_type));
            }
            Some(_) => {}
        }
    }
    for name in current.fields.keys() {
        if !inferred.fields.contains_key(name) {
            diff.removed.push(name.clone());
        }
    }

    diff.breaking = !first_import
        && (!diff.removed.is_empty()
            || !diff.retyped.is_empty()
            || diff.added.values().any(|def| def.required));
    diff
}

/// The approval decision table. An empty diff always continues: there is
/// nothing to approve.
pub fn decide(locked: bool, auto_approve_non_breaking: bool, diff: &SchemaDiff) -> SchemaDecision {
    if diff.is_empty() {
        return SchemaDecision::AutoApprove;
    }
    if locked {
        return SchemaDecision::AwaitApproval;
    }
    if auto_approve_non_breaking && !diff.is_breaking() {
        return SchemaDecision::AutoApprove;
    }
    SchemaDecision::AwaitApproval
}

/// Merge an approved diff into the current schema, producing the next
/// immutable version's field set.
pub fn apply_diff(current: &DataSchema, inferred: &DataSchema) -> DataSchema {
    let mut fields = current.fields.clone();
    for (name, def) in &inferred.fields {
        fields.insert(name.clone(), def.clone());
    }
    // Fields no longer observed stay in the schema as optional: historical
    // events still carry them.
    for (name, def) in fields.iter_mut() {
        if !inferred.fields.contains_key(name) {
            def.required = false;
        }
    }
    DataSchema { fields }
}
