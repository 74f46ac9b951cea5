//! In-memory evaluation of [`FilterClause`]s against records.
//!
//! Backends without a native query engine (and the realtime broadcaster,
//! which matches change events against subscription filters) evaluate
//! clauses here. Comparison is deliberately loose across JSON scalar kinds:
//! a numeric `7` matches the string `"7"`, because ids cross the JSON:API
//! boundary as decimal strings while backends may store them numerically.

use std::cmp::Ordering;

use serde_json::Value;

use crate::query::{CompareOp, FilterClause, SortDirection, SortKey};
use crate::record::Record;

/// Loose scalar equality: numbers and strings compare by canonical string
/// form, null only equals null.
pub fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => false,
    }
}

/// Total ordering over scalars for sort keys and range operators.
///
/// Numbers order numerically (including number-vs-numeric-string), strings
/// lexicographically; null sorts first; mismatched kinds fall back to their
/// string forms.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn as_f64(v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => value_text(a).cmp(&value_text(b)),
        },
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// SQL-`LIKE` matching with `%` wildcards, case-insensitive.
pub fn like_match(pattern: &str, value: &Value) -> bool {
    let text = value_text(value).to_lowercase();
    let pattern = pattern.to_lowercase();

    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }

    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(found) => {
                // Without a leading %, the first literal must anchor at 0.
                if i == 0 && found != 0 {
                    return false;
                }
                pos += found + part.len();
            }
            None => return false,
        }
    }
    // Without a trailing %, the last literal must anchor at the end.
    if let Some(last) = parts.last() {
        if !last.is_empty() && !text.ends_with(last) {
            return false;
        }
    }
    true
}

/// Evaluate one clause against a record. Absent fields are treated as null.
pub fn matches_clause(record: &Record, clause: &FilterClause) -> bool {
    let field_value = record.get(&clause.field).unwrap_or(&Value::Null);
    match clause.op {
        CompareOp::Eq => values_eq(field_value, &clause.value),
        CompareOp::Ne => !values_eq(field_value, &clause.value),
        CompareOp::Lt => compare_values(field_value, &clause.value) == Ordering::Less,
        CompareOp::Lte => compare_values(field_value, &clause.value) != Ordering::Greater,
        CompareOp::Gt => compare_values(field_value, &clause.value) == Ordering::Greater,
        CompareOp::Gte => compare_values(field_value, &clause.value) != Ordering::Less,
        CompareOp::Like => match &clause.value {
            Value::String(pattern) => like_match(pattern, field_value),
            _ => false,
        },
        CompareOp::In => match &clause.value {
            Value::Array(candidates) => candidates.iter().any(|c| values_eq(field_value, c)),
            single => values_eq(field_value, single),
        },
        CompareOp::Between => match &clause.value {
            Value::Array(bounds) if bounds.len() == 2 => {
                compare_values(field_value, &bounds[0]) != Ordering::Less
                    && compare_values(field_value, &bounds[1]) != Ordering::Greater
            }
            _ => false,
        },
    }
}

/// Evaluate all clauses (AND semantics).
pub fn matches_all(record: &Record, clauses: &[FilterClause]) -> bool {
    clauses.iter().all(|c| matches_clause(record, c))
}

/// Compare two records under an ordered list of sort keys.
pub fn compare_records(a: &Record, b: &Record, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let av = a.get(&key.field).unwrap_or(&Value::Null);
        let bv = b.get(&key.field).unwrap_or(&Value::Null);
        let ord = match key.direction {
            SortDirection::Asc => compare_values(av, bv),
            SortDirection::Desc => compare_values(bv, av),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn loose_equality_crosses_number_and_string() {
        assert!(values_eq(&json!(7), &json!("7")));
        assert!(values_eq(&json!("7"), &json!(7)));
        assert!(!values_eq(&json!(7), &json!("8")));
        assert!(!values_eq(&json!(null), &json!("null")));
    }

    #[test]
    fn like_supports_wildcards() {
        assert!(like_match("%lice%", &json!("Alice")));
        assert!(like_match("al%", &json!("Alice")));
        assert!(like_match("%ice", &json!("Alice")));
        assert!(!like_match("al%", &json!("Malice")));
        assert!(!like_match("%ice", &json!("Iceland")));
        assert!(like_match("alice", &json!("ALICE")));
    }

    #[test]
    fn between_is_inclusive() {
        let rec = record(&[("age", json!(30))]);
        assert!(matches_clause(
            &rec,
            &FilterClause::new("age", CompareOp::Between, json!([30, 40]))
        ));
        assert!(!matches_clause(
            &rec,
            &FilterClause::new("age", CompareOp::Between, json!([31, 40]))
        ));
    }

    #[test]
    fn in_matches_stringified_ids() {
        let rec = record(&[("author_id", json!(7))]);
        assert!(matches_clause(
            &rec,
            &FilterClause::id_in("author_id", &["7".into(), "9".into()])
        ));
    }

    #[test]
    fn absent_field_is_null() {
        let rec = record(&[]);
        assert!(matches_clause(
            &rec,
            &FilterClause::eq("missing", json!(null))
        ));
        assert!(!matches_clause(&rec, &FilterClause::eq("missing", json!(1))));
    }

    #[test]
    fn record_ordering_respects_direction_and_ties() {
        let a = record(&[("rank", json!(1)), ("name", json!("b"))]);
        let b = record(&[("rank", json!(1)), ("name", json!("a"))]);
        let keys = vec![SortKey::asc("rank"), SortKey::desc("name")];
        assert_eq!(compare_records(&a, &b, &keys), Ordering::Less);
    }
}
