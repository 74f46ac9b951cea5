//! # japi-data-memory — In-memory storage backend
//!
//! A complete [`StorageAdapter`] over process memory: tables are vectors of
//! JSON records, ids auto-increment per table, and transactions are
//! whole-store snapshots. This is the reference backend the test suites
//! drive; it exists so engine behavior (ownership filters, include windows,
//! transactional broadcast ordering) can be exercised without a database.
//!
//! Two toggles matter for tests:
//! - [`MemoryBackend::with_window_functions`] controls the
//!   `window_functions` capability, so the unsupported-operation path of
//!   per-parent include limits can be exercised.
//! - [`MemoryBackend::with_unique`] declares unique columns, so conflict
//!   (409) paths can be exercised.
//!
//! Transactions are snapshot-based with last-commit-wins semantics. That is
//! sufficient for a single-writer test harness; it is not a concurrency
//! story for production data.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use japi_data::compare::{compare_records, matches_all};
use japi_data::{
    Capabilities, FilterClause, PaginationMeta, Query, QueryResult, Record, StorageAdapter,
    StorageError, TransactionHandle, Tx,
};

#[derive(Clone, Default)]
struct Table {
    next_id: i64,
    rows: Vec<Record>,
}

type Tables = HashMap<String, Table>;

#[derive(Default)]
struct State {
    committed: Tables,
    transactions: HashMap<TransactionHandle, Tables>,
}

/// In-memory [`StorageAdapter`].
pub struct MemoryBackend {
    state: Mutex<State>,
    unique: HashMap<String, Vec<String>>,
    window_functions: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            unique: HashMap::new(),
            window_functions: true,
        }
    }

    /// Toggle the `window_functions` capability.
    pub fn with_window_functions(mut self, enabled: bool) -> Self {
        self.window_functions = enabled;
        self
    }

    /// Declare a unique column on a table. Violations surface as
    /// [`StorageError::UniqueViolation`].
    pub fn with_unique(mut self, resource: impl Into<String>, field: impl Into<String>) -> Self {
        self.unique
            .entry(resource.into())
            .or_default()
            .push(field.into());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Lock poisoning only happens if a panic occurred under the lock;
        // the store is still structurally sound for tests, so recover.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_unique(
        &self,
        resource: &str,
        table: &Table,
        row: &Record,
        skip_index: Option<usize>,
    ) -> Result<(), StorageError> {
        let Some(fields) = self.unique.get(resource) else {
            return Ok(());
        };
        for field in fields {
            let Some(value) = row.get(field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let clash = table.rows.iter().enumerate().any(|(i, existing)| {
                Some(i) != skip_index
                    && existing
                        .get(field)
                        .is_some_and(|v| japi_data::compare::values_eq(v, value))
            });
            if clash {
                return Err(StorageError::UniqueViolation {
                    resource: resource.to_string(),
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }
}

fn workspace<'a>(state: &'a mut State, tx: Tx<'_>) -> Result<&'a mut Tables, StorageError> {
    match tx {
        None => Ok(&mut state.committed),
        Some(handle) => state
            .transactions
            .get_mut(handle)
            .ok_or(StorageError::InvalidTransaction),
    }
}

fn find_row<'a>(table: &'a Table, id: &str) -> Option<(usize, &'a Record)> {
    table
        .rows
        .iter()
        .enumerate()
        .find(|(_, row)| japi_data::record_id(row, "id").as_deref() == Some(id))
}

fn apply_selection(row: &Record, selection: Option<&[String]>) -> Record {
    match selection {
        None => row.clone(),
        Some(columns) => row
            .iter()
            .filter(|(k, _)| columns.iter().any(|c| c == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

fn apply_window(rows: Vec<Record>, query: &Query) -> Vec<Record> {
    let Some(window) = &query.window else {
        return rows;
    };
    let mut partitioned: Vec<Record> = rows;
    partitioned.sort_by(|a, b| {
        let pa = a.get(&window.partition_by).unwrap_or(&Value::Null);
        let pb = b.get(&window.partition_by).unwrap_or(&Value::Null);
        japi_data::compare::compare_values(pa, pb)
            .then_with(|| compare_records(a, b, &window.order_by))
    });
    let mut counts: HashMap<String, u64> = HashMap::new();
    partitioned
        .into_iter()
        .filter(|row| {
            let key = row
                .get(&window.partition_by)
                .map(|v| v.to_string())
                .unwrap_or_default();
            let seen = counts.entry(key).or_insert(0);
            *seen += 1;
            *seen <= window.limit
        })
        .collect()
}

#[async_trait::async_trait]
impl StorageAdapter for MemoryBackend {
    async fn exists(&self, resource: &str, id: &str, tx: Tx<'_>) -> Result<bool, StorageError> {
        Ok(self.get_minimal(resource, id, tx).await?.is_some())
    }

    async fn get_minimal(
        &self,
        resource: &str,
        id: &str,
        tx: Tx<'_>,
    ) -> Result<Option<Record>, StorageError> {
        self.get(resource, id, None, tx).await
    }

    async fn get(
        &self,
        resource: &str,
        id: &str,
        selection: Option<&[String]>,
        tx: Tx<'_>,
    ) -> Result<Option<Record>, StorageError> {
        let mut state = self.lock();
        let tables = workspace(&mut state, tx)?;
        let Some(table) = tables.get(resource) else {
            return Ok(None);
        };
        Ok(find_row(table, id).map(|(_, row)| apply_selection(row, selection)))
    }

    async fn query(
        &self,
        resource: &str,
        query: &Query,
        tx: Tx<'_>,
    ) -> Result<QueryResult, StorageError> {
        if query.window.is_some() && !self.window_functions {
            return Err(StorageError::unsupported("window_functions"));
        }

        let mut state = self.lock();
        let tables = workspace(&mut state, tx)?;
        let rows = tables
            .get(resource)
            .map(|t| t.rows.clone())
            .unwrap_or_default();

        let mut matched: Vec<Record> = rows
            .into_iter()
            .filter(|row| matches_all(row, &query.filters))
            .collect();
        if !query.sort.is_empty() {
            matched.sort_by(|a, b| compare_records(a, b, &query.sort));
        }
        matched = apply_window(matched, query);

        let selection = query.selection.as_deref();
        match query.page {
            None => Ok(QueryResult::new(
                matched
                    .iter()
                    .map(|row| apply_selection(row, selection))
                    .collect(),
            )),
            Some(page) => {
                let total = matched.len() as u64;
                let meta = PaginationMeta::new(page.number, page.size, total);
                let records = matched
                    .iter()
                    .skip(page.offset() as usize)
                    .take(page.size as usize)
                    .map(|row| apply_selection(row, selection))
                    .collect();
                Ok(QueryResult::paged(records, meta))
            }
        }
    }

    async fn insert(
        &self,
        resource: &str,
        attributes: &Record,
        tx: Tx<'_>,
    ) -> Result<Record, StorageError> {
        let mut row = attributes.clone();
        let mut state = self.lock();
        let tables = workspace(&mut state, tx)?;
        let table = tables.entry(resource.to_string()).or_default();

        let provided = row.get("id").filter(|v| !v.is_null()).cloned();
        match provided {
            Some(id) => {
                if let Some(n) = id.as_i64().or_else(|| id.as_str().and_then(|s| s.parse().ok())) {
                    table.next_id = table.next_id.max(n);
                }
            }
            None => {
                table.next_id += 1;
                row.insert("id".to_string(), Value::from(table.next_id));
            }
        }

        self.check_unique(resource, table, &row, None)?;
        table.rows.push(row.clone());
        Ok(row)
    }

    async fn update(
        &self,
        resource: &str,
        id: &str,
        attributes: &Record,
        tx: Tx<'_>,
    ) -> Result<Record, StorageError> {
        let mut state = self.lock();
        let tables = workspace(&mut state, tx)?;
        let table = tables
            .get_mut(resource)
            .ok_or_else(|| StorageError::UnknownResource(resource.to_string()))?;
        let (index, existing) = find_row(table, id)
            .ok_or_else(|| StorageError::UnknownResource(format!("{resource}/{id}")))?;

        let mut merged = existing.clone();
        for (key, value) in attributes {
            if key == "id" {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
        self.check_unique(resource, table, &merged, Some(index))?;
        table.rows[index] = merged.clone();
        Ok(merged)
    }

    async fn replace(
        &self,
        resource: &str,
        id: &str,
        attributes: &Record,
        tx: Tx<'_>,
    ) -> Result<Record, StorageError> {
        let mut state = self.lock();
        let tables = workspace(&mut state, tx)?;
        let table = tables
            .get_mut(resource)
            .ok_or_else(|| StorageError::UnknownResource(resource.to_string()))?;
        let (index, existing) = find_row(table, id)
            .ok_or_else(|| StorageError::UnknownResource(format!("{resource}/{id}")))?;

        let mut replaced = attributes.clone();
        replaced.insert(
            "id".to_string(),
            existing.get("id").cloned().unwrap_or(Value::Null),
        );
        self.check_unique(resource, table, &replaced, Some(index))?;
        table.rows[index] = replaced.clone();
        Ok(replaced)
    }

    async fn delete(&self, resource: &str, id: &str, tx: Tx<'_>) -> Result<bool, StorageError> {
        let mut state = self.lock();
        let tables = workspace(&mut state, tx)?;
        let Some(table) = tables.get_mut(resource) else {
            return Ok(false);
        };
        let before = table.rows.len();
        table
            .rows
            .retain(|row| japi_data::record_id(row, "id").as_deref() != Some(id));
        Ok(table.rows.len() < before)
    }

    async fn pivot_insert(
        &self,
        through: &str,
        rows: &[Record],
        tx: Tx<'_>,
    ) -> Result<(), StorageError> {
        let mut state = self.lock();
        let tables = workspace(&mut state, tx)?;
        let table = tables.entry(through.to_string()).or_default();
        for row in rows {
            let mut stored = row.clone();
            table.next_id += 1;
            stored
                .entry("id".to_string())
                .or_insert(Value::from(table.next_id));
            table.rows.push(stored);
        }
        Ok(())
    }

    async fn pivot_delete(
        &self,
        through: &str,
        filters: &[FilterClause],
        tx: Tx<'_>,
    ) -> Result<u64, StorageError> {
        let mut state = self.lock();
        let tables = workspace(&mut state, tx)?;
        let Some(table) = tables.get_mut(through) else {
            return Ok(0);
        };
        let before = table.rows.len();
        table.rows.retain(|row| !matches_all(row, filters));
        Ok((before - table.rows.len()) as u64)
    }

    async fn begin(&self) -> Result<TransactionHandle, StorageError> {
        let handle = TransactionHandle::new();
        let mut state = self.lock();
        let snapshot = state.committed.clone();
        state.transactions.insert(handle, snapshot);
        Ok(handle)
    }

    async fn commit(&self, tx: TransactionHandle) -> Result<(), StorageError> {
        let mut state = self.lock();
        let snapshot = state
            .transactions
            .remove(&tx)
            .ok_or(StorageError::InvalidTransaction)?;
        state.committed = snapshot;
        Ok(())
    }

    async fn rollback(&self, tx: TransactionHandle) -> Result<(), StorageError> {
        let mut state = self.lock();
        state
            .transactions
            .remove(&tx)
            .ok_or(StorageError::InvalidTransaction)?;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new("memory")
            .with_window_functions(self.window_functions)
            .with_version(env!("CARGO_PKG_VERSION"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use japi_data::{CompareOp, PageSpec, SortKey, WindowSpec};
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn insert_assigns_incrementing_ids() {
        let store = MemoryBackend::new();
        let a = store
            .insert("articles", &record(&[("title", json!("A"))]), None)
            .await
            .unwrap();
        let b = store
            .insert("articles", &record(&[("title", json!("B"))]), None)
            .await
            .unwrap();
        assert_eq!(a.get("id"), Some(&json!(1)));
        assert_eq!(b.get("id"), Some(&json!(2)));
        assert!(store.exists("articles", "2", None).await.unwrap());
    }

    #[tokio::test]
    async fn update_merges_and_replace_overwrites() {
        let store = MemoryBackend::new();
        store
            .insert(
                "articles",
                &record(&[("title", json!("A")), ("body", json!("old"))]),
                None,
            )
            .await
            .unwrap();

        let patched = store
            .update("articles", "1", &record(&[("title", json!("B"))]), None)
            .await
            .unwrap();
        assert_eq!(patched.get("body"), Some(&json!("old")));

        let replaced = store
            .replace("articles", "1", &record(&[("title", json!("C"))]), None)
            .await
            .unwrap();
        assert_eq!(replaced.get("body"), None);
        assert_eq!(replaced.get("id"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn query_filters_sorts_and_pages() {
        let store = MemoryBackend::new();
        for (title, rank) in [("a", 3), ("b", 1), ("c", 2), ("d", 9)] {
            store
                .insert(
                    "articles",
                    &record(&[("title", json!(title)), ("rank", json!(rank))]),
                    None,
                )
                .await
                .unwrap();
        }
        let q = Query::new()
            .filter(FilterClause::new("rank", CompareOp::Lt, json!(9)))
            .order_by(SortKey::asc("rank"))
            .page(PageSpec::new(1, 2));
        let result = store.query("articles", &q, None).await.unwrap();
        let titles: Vec<_> = result
            .records
            .iter()
            .map(|r| r.get("title").cloned().unwrap())
            .collect();
        assert_eq!(titles, vec![json!("b"), json!("c")]);
        let meta = result.pagination.unwrap();
        assert_eq!(meta.total, 3);
        assert_eq!(meta.page_count, 2);
    }

    #[tokio::test]
    async fn window_limits_rows_per_partition() {
        let store = MemoryBackend::new();
        for parent in [1, 2] {
            for n in 0..5 {
                store
                    .insert(
                        "comments",
                        &record(&[("article_id", json!(parent)), ("n", json!(n))]),
                        None,
                    )
                    .await
                    .unwrap();
            }
        }
        let q = Query::new().window(WindowSpec {
            partition_by: "article_id".into(),
            order_by: vec![SortKey::asc("n")],
            limit: 3,
        });
        let result = store.query("comments", &q, None).await.unwrap();
        assert_eq!(result.records.len(), 6);
    }

    #[tokio::test]
    async fn window_without_capability_is_unsupported() {
        let store = MemoryBackend::new().with_window_functions(false);
        let q = Query::new().window(WindowSpec {
            partition_by: "article_id".into(),
            order_by: vec![],
            limit: 3,
        });
        let err = store.query("comments", &q, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { feature } if feature == "window_functions"));
    }

    #[tokio::test]
    async fn unique_violation_reported() {
        let store = MemoryBackend::new().with_unique("users", "email");
        store
            .insert("users", &record(&[("email", json!("a@b.c"))]), None)
            .await
            .unwrap();
        let err = store
            .insert("users", &record(&[("email", json!("a@b.c"))]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UniqueViolation { field, .. } if field == "email"));
    }

    #[tokio::test]
    async fn rollback_discards_and_commit_publishes() {
        let store = MemoryBackend::new();

        let tx = store.begin().await.unwrap();
        store
            .insert("articles", &record(&[("title", json!("ghost"))]), Some(&tx))
            .await
            .unwrap();
        store.rollback(tx).await.unwrap();
        assert!(!store.exists("articles", "1", None).await.unwrap());

        let tx = store.begin().await.unwrap();
        store
            .insert("articles", &record(&[("title", json!("real"))]), Some(&tx))
            .await
            .unwrap();
        // Not visible outside the transaction until commit.
        assert!(!store.exists("articles", "1", None).await.unwrap());
        store.commit(tx).await.unwrap();
        assert!(store.exists("articles", "1", None).await.unwrap());
    }

    #[tokio::test]
    async fn pivot_rows_insert_and_delete() {
        let store = MemoryBackend::new();
        store
            .pivot_insert(
                "article_tags",
                &[
                    record(&[("article_id", json!(1)), ("tag_id", json!(10))]),
                    record(&[("article_id", json!(1)), ("tag_id", json!(11))]),
                    record(&[("article_id", json!(2)), ("tag_id", json!(10))]),
                ],
                None,
            )
            .await
            .unwrap();
        let removed = store
            .pivot_delete(
                "article_tags",
                &[FilterClause::eq("article_id", json!(1))],
                None,
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);
    }
}
