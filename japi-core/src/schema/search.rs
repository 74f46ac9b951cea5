//! Search schema: which fields a resource can be filtered and sorted by,
//! with what operator semantics, and how filters evaluate both as storage
//! clauses and in memory (the broadcaster matches change events against
//! subscription filters without a round-trip to storage).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use japi_data::compare::matches_clause;
use japi_data::{CompareOp, FilterClause, Record};

use crate::error::{ApiError, Violation};

/// In-memory predicate backing a custom filter: `(record, filter value) -> bool`.
pub type RecordPredicate = Arc<dyn Fn(&Record, &Value) -> bool + Send + Sync>;

/// How a declared filter evaluates.
#[derive(Clone)]
pub enum FilterKind {
    /// A plain comparison operator on the stored column.
    Op(CompareOp),
    /// A custom predicate. Backends may translate it natively; without a
    /// `filter_record` predicate it is SQL-only and cannot back realtime
    /// subscription matching.
    Custom { filter_record: Option<RecordPredicate> },
}

impl std::fmt::Debug for FilterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterKind::Op(op) => write!(f, "Op({op:?})"),
            FilterKind::Custom { filter_record } => write!(
                f,
                "Custom {{ filter_record: {} }}",
                if filter_record.is_some() { "yes" } else { "sql-only" }
            ),
        }
    }
}

/// One filterable/sortable field.
#[derive(Debug, Clone)]
pub struct SearchField {
    /// The stored column the public filter name maps to.
    pub field: String,
    pub kind: FilterKind,
    pub sortable: bool,
}

impl SearchField {
    /// Whether this filter can back realtime subscription matching.
    pub fn supports_record_matching(&self) -> bool {
        match &self.kind {
            FilterKind::Op(_) => true,
            FilterKind::Custom { filter_record } => filter_record.is_some(),
        }
    }
}

/// The declared search surface of a resource, keyed by public filter name.
#[derive(Debug, Clone, Default)]
pub struct SearchSchema {
    pub fields: BTreeMap<String, SearchField>,
}

impl SearchSchema {
    pub fn get(&self, name: &str) -> Option<&SearchField> {
        self.fields.get(name)
    }

    pub fn is_sortable(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|f| f.sortable)
    }
}

/// URL filter values arrive as strings; multi-valued operators take a
/// comma-separated list. Subscription filters may already carry JSON
/// arrays.
fn coerce_value(op: CompareOp, value: &Value) -> Value {
    match op {
        CompareOp::In | CompareOp::Between => match value {
            Value::Array(_) => value.clone(),
            Value::String(s) => Value::Array(
                s.split(',')
                    .map(|part| Value::String(part.trim().to_string()))
                    .collect(),
            ),
            other => Value::Array(vec![other.clone()]),
        },
        _ => value.clone(),
    }
}

/// Translate public filters into storage clauses via the search schema.
/// Unknown filter names are semantic violations.
pub fn translate_filters(
    schema: &SearchSchema,
    filters: &BTreeMap<String, Value>,
) -> Result<Vec<FilterClause>, ApiError> {
    let mut clauses = Vec::with_capacity(filters.len());
    let mut violations = Vec::new();
    for (name, value) in filters {
        match schema.get(name) {
            None => violations.push(Violation::new(
                format!("filter.{name}"),
                "unknown_filter",
                format!("No filterable field named {name}"),
            )),
            Some(search_field) => match &search_field.kind {
                FilterKind::Op(op) => clauses.push(FilterClause::new(
                    search_field.field.clone(),
                    *op,
                    coerce_value(*op, value),
                )),
                // Custom filters degrade to equality at the clause layer;
                // backends with native support intercept by filter name.
                FilterKind::Custom { .. } => {
                    clauses.push(FilterClause::eq(search_field.field.clone(), value.clone()))
                }
            },
        }
    }
    if violations.is_empty() {
        Ok(clauses)
    } else {
        Err(ApiError::validation(violations))
    }
}

/// Evaluate public filters against a record in memory. Used by the
/// broadcaster to match change events; relationship filters compare
/// stringified ids through the loose scalar comparison.
pub fn matches_filters(
    schema: &SearchSchema,
    filters: &BTreeMap<String, Value>,
    record: &Record,
) -> bool {
    filters.iter().all(|(name, value)| {
        let Some(search_field) = schema.get(name) else {
            return false;
        };
        match &search_field.kind {
            FilterKind::Op(op) => matches_clause(
                record,
                &FilterClause::new(search_field.field.clone(), *op, coerce_value(*op, value)),
            ),
            FilterKind::Custom { filter_record } => match filter_record {
                Some(predicate) => predicate(record, value),
                None => false,
            },
        }
    })
}
