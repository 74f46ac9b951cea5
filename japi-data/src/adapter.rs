use uuid::Uuid;

use crate::error::StorageError;
use crate::page::QueryResult;
use crate::query::{FilterClause, Query};
use crate::record::Record;

/// Opaque identity of a storage transaction.
///
/// Adapter methods accept an optional handle; broadcasts produced inside a
/// transaction are buffered keyed by this identity, so it must be cheap to
/// clone, hash, and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle(Uuid);

impl TransactionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx:{}", self.0)
    }
}

/// Optional transaction argument threaded through adapter calls.
pub type Tx<'a> = Option<&'a TransactionHandle>;

/// Feature report the engine consults before issuing advanced queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether the backend supports partitioned row-number ranking
    /// (required for per-parent include limits).
    pub window_functions: bool,
    /// Backend dialect name, e.g. `"memory"`, `"postgres"`.
    pub dialect: String,
    /// Backend/client version string, when known.
    pub version: Option<String>,
}

impl Capabilities {
    pub fn new(dialect: impl Into<String>) -> Self {
        Self {
            window_functions: false,
            dialect: dialect.into(),
            version: None,
        }
    }

    pub fn with_window_functions(mut self, enabled: bool) -> Self {
        self.window_functions = enabled;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// The storage capability the request engine drives.
///
/// One implementation per physical backend. All reads and writes take an
/// optional [`TransactionHandle`]; `None` means auto-commit. Implementations
/// must be safe to share across request workers (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Whether a record with the given id exists.
    async fn exists(&self, resource: &str, id: &str, tx: Tx<'_>) -> Result<bool, StorageError>;

    /// Fetch the minimal snapshot of a record: id plus the attributes
    /// needed to evaluate ownership. `None` if absent.
    async fn get_minimal(
        &self,
        resource: &str,
        id: &str,
        tx: Tx<'_>,
    ) -> Result<Option<Record>, StorageError>;

    /// Fetch a full record, optionally restricted to a column selection.
    async fn get(
        &self,
        resource: &str,
        id: &str,
        selection: Option<&[String]>,
        tx: Tx<'_>,
    ) -> Result<Option<Record>, StorageError>;

    /// Run a filtered/sorted/paged query.
    async fn query(
        &self,
        resource: &str,
        query: &Query,
        tx: Tx<'_>,
    ) -> Result<QueryResult, StorageError>;

    /// Insert a record, returning the stored row (with generated id).
    async fn insert(
        &self,
        resource: &str,
        attributes: &Record,
        tx: Tx<'_>,
    ) -> Result<Record, StorageError>;

    /// Partially update a record, returning the stored row.
    async fn update(
        &self,
        resource: &str,
        id: &str,
        attributes: &Record,
        tx: Tx<'_>,
    ) -> Result<Record, StorageError>;

    /// Fully replace a record, returning the stored row.
    async fn replace(
        &self,
        resource: &str,
        id: &str,
        attributes: &Record,
        tx: Tx<'_>,
    ) -> Result<Record, StorageError>;

    /// Delete a record. Returns whether a row was removed.
    async fn delete(&self, resource: &str, id: &str, tx: Tx<'_>) -> Result<bool, StorageError>;

    /// Insert rows into a pivot table.
    async fn pivot_insert(
        &self,
        through: &str,
        rows: &[Record],
        tx: Tx<'_>,
    ) -> Result<(), StorageError>;

    /// Delete pivot rows matching all the given clauses. Returns the number
    /// of rows removed.
    async fn pivot_delete(
        &self,
        through: &str,
        filters: &[FilterClause],
        tx: Tx<'_>,
    ) -> Result<u64, StorageError>;

    /// Open a new transaction.
    async fn begin(&self) -> Result<TransactionHandle, StorageError>;

    /// Commit a transaction opened with [`begin`](Self::begin).
    async fn commit(&self, tx: TransactionHandle) -> Result<(), StorageError>;

    /// Roll back a transaction opened with [`begin`](Self::begin).
    async fn rollback(&self, tx: TransactionHandle) -> Result<(), StorageError>;

    /// Report backend features.
    fn capabilities(&self) -> Capabilities;
}
