use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator attached to a [`FilterClause`].
///
/// The operator set mirrors what a search schema can declare for a field;
/// backends translate each to their native predicate form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    In,
    Between,
}

/// A single predicate: `field <op> value`.
///
/// For [`CompareOp::In`] the value is an array of candidates; for
/// [`CompareOp::Between`] a two-element array `[low, high]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl FilterClause {
    pub fn new(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Shorthand for the most common clause form.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, CompareOp::Eq, value)
    }

    /// Shorthand for an `IN (…)` clause over stringified ids.
    pub fn id_in(field: impl Into<String>, ids: &[String]) -> Self {
        Self::new(
            field,
            CompareOp::In,
            Value::Array(ids.iter().map(|id| Value::String(id.clone())).collect()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One ordering key. `-field` syntax at the query-string layer becomes
/// `SortDirection::Desc` here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }

    /// Parse the `-`-prefixed query-string form.
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(field) => Self::desc(field),
            None => Self::asc(spec),
        }
    }
}

/// Page request: 1-based page number and page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpec {
    pub number: u64,
    pub size: u64,
}

impl PageSpec {
    pub fn new(number: u64, size: u64) -> Self {
        Self {
            number: number.max(1),
            size,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.number - 1) * self.size
    }
}

/// Per-parent windowing: a row-number ranking over `PARTITION BY
/// partition_by ORDER BY order_by`, keeping at most `limit` rows per
/// partition.
///
/// Backends without window-function support must refuse a query carrying
/// one of these with [`StorageError::Unsupported`](crate::StorageError).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub partition_by: String,
    pub order_by: Vec<SortKey>,
    pub limit: u64,
}

/// A backend-neutral query executed by a [`StorageAdapter`](crate::StorageAdapter).
///
/// All clauses are ANDed. `selection` limits the returned columns; `None`
/// means all columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<FilterClause>,
    pub sort: Vec<SortKey>,
    pub page: Option<PageSpec>,
    pub window: Option<WindowSpec>,
    pub selection: Option<Vec<String>>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, clause: FilterClause) -> Self {
        self.filters.push(clause);
        self
    }

    pub fn order_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn page(mut self, page: PageSpec) -> Self {
        self.page = Some(page);
        self
    }

    pub fn window(mut self, window: WindowSpec) -> Self {
        self.window = Some(window);
        self
    }

    pub fn select(mut self, columns: Vec<String>) -> Self {
        self.selection = Some(columns);
        self
    }
}
