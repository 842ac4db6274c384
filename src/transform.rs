//! Field-level type coercions applied before event creation.
//!
//! Every attempted coercion records a [`TransformNote`] so an event carries
//! full provenance of how its payload diverged from the source row. A value
//! that cannot be coerced keeps its original form; the note is marked not
//! applied and the row continues.

use serde_json::{Map, Value};

use crate::models::{TransformKind, TransformNote, TransformRule, ValidationStatus};
use crate::schema_engine::looks_like_date;

/// Result of transforming one row.
#[derive(Debug, Clone)]
pub struct TransformedRow {
    pub data: Map<String, Value>,
    pub notes: Vec<TransformNote>,
    pub status: ValidationStatus,
}

/// Apply a dataset's transformation rules to one row.
pub fn transform_row(rules: &[TransformRule], row: &Map<String, Value>) -> TransformedRow {
    let mut data = row.clone();
    let mut notes = Vec::new();
    let mut any_applied = false;
    let mut any_rejected = false;

    for rule in rules {
        let Some(original) = data.get(&rule.field).cloned() else {
            continue;
        };
        match coerce(rule.kind, &original) {
            Some(coerced) => {
                let changed = coerced != original;
                if changed {
                    notes.push(TransformNote {
                        field: rule.field.clone(),
                        rule: rule_name(rule.kind).to_string(),
                        from: original,
                        to: coerced.clone(),
                        applied: true,
                    });
                    data.insert(rule.field.clone(), coerced);
                    any_applied = true;
                }
            }
            None => {
                notes.push(TransformNote {
                    field: rule.field.clone(),
                    rule: rule_name(rule.kind).to_string(),
                    from: original.clone(),
                    to: original,
                    applied: false,
                });
                any_rejected = true;
            }
        }
    }

    let status = if any_rejected {
        ValidationStatus::Rejected
    } else if any_applied {
        ValidationStatus::Transformed
    } else {
        ValidationStatus::Pending
    };

    TransformedRow {
        data,
        notes,
        status,
    }
}

fn rule_name(kind: TransformKind) -> &'static str {
    match kind {
        TransformKind::ToNumber => "to-number",
        TransformKind::ToDate => "to-date",
        TransformKind::ToBoolean => "to-boolean",
        TransformKind::ToString => "to-string",
        TransformKind::Trim => "trim",
    }
}

/// Coerce one value. `None` means the value has no sensible representation
/// under the rule.
fn coerce(kind: TransformKind, value: &Value) -> Option<Value> {
    match kind {
        TransformKind::ToNumber => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => {
                let s = s.trim().replace(',', "");
                if let Ok(i) = s.parse::<i64>() {
                    Some(Value::from(i))
                } else {
                    s.parse::<f64>().ok().map(Value::from)
                }
            }
            Value::Bool(b) => Some(Value::from(if *b { 1 } else { 0 })),
            _ => None,
        },
        TransformKind::ToDate => match value {
            Value::String(s) => normalize_date(s).map(Value::String),
            _ => None,
        },
        TransformKind::ToBoolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "n" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            Value::Number(n) => {
                let v = n.as_f64()?;
                if v == 0.0 {
                    Some(Value::Bool(false))
                } else if v == 1.0 {
                    Some(Value::Bool(true))
                } else {
                    None
                }
            }
            _ => None,
        },
        TransformKind::ToString => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        TransformKind::Trim => match value {
            Value::String(s) => Some(Value::String(s.trim().to_string())),
            other => Some(other.clone()),
        },
    }
}

/// Normalize recognized date shapes to ISO `YYYY-MM-DD` (datetimes keep
/// their time component).
fn normalize_date(s: &str) -> Option<String> {
    let s = s.trim();
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.format("%Y-%m-%d").to_string());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%m/%d/%Y") {
        return Some(date.format("%Y-%m-%d").to_string());
    }
    if looks_like_date(s) {
        return Some(s.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(field: &str, kind: TransformKind) -> TransformRule {
        TransformRule {
            field: field.to_string(),
            kind,
        }
    }

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_number_coercion_records_provenance() {
        let rules = vec![rule("attendance", TransformKind::ToNumber)];
        let out = transform_row(&rules, &row(json!({"attendance": "1,250"})));

        assert_eq!(out.data["attendance"], json!(1250));
        assert_eq!(out.status, ValidationStatus::Transformed);
        assert_eq!(out.notes.len(), 1);
        assert!(out.notes[0].applied);
        assert_eq!(out.notes[0].rule, "to-number");
        assert_eq!(out.notes[0].from, json!("1,250"));
    }

    #[test]
    fn test_uncoercible_value_is_kept_and_noted() {
        let rules = vec![rule("attendance", TransformKind::ToNumber)];
        let out = transform_row(&rules, &row(json!({"attendance": "unknown"})));

        // The original value survives; the row is marked, not dropped.
        assert_eq!(out.data["attendance"], json!("unknown"));
        assert_eq!(out.status, ValidationStatus::Rejected);
        assert!(!out.notes[0].applied);
    }

    #[test]
    fn test_date_normalization() {
        let rules = vec![rule("date", TransformKind::ToDate)];
        let out = transform_row(&rules, &row(json!({"date": "06/15/2024"})));
        assert_eq!(out.data["date"], json!("2024-06-15"));
    }

    #[test]
    fn test_boolean_variants() {
        let rules = vec![rule("active", TransformKind::ToBoolean)];
        for (input, expected) in [("yes", true), ("No", false), ("1", true)] {
            let out = transform_row(&rules, &row(json!({ "active": input })));
            assert_eq!(out.data["active"], json!(expected), "input {:?}", input);
        }
    }

    #[test]
    fn test_missing_field_and_noop_leave_row_pending() {
        let rules = vec![
            rule("absent", TransformKind::ToNumber),
            rule("count", TransformKind::ToNumber),
        ];
        // "count" is already a number; nothing changes.
        let out = transform_row(&rules, &row(json!({"count": 5})));
        assert_eq!(out.status, ValidationStatus::Pending);
        assert!(out.notes.is_empty());
    }
}
