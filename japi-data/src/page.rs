use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Pagination metadata reported by a backend alongside a page of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub page: u64,
    pub page_size: u64,
    pub page_count: u64,
    pub total: u64,
}

impl PaginationMeta {
    pub fn new(page: u64, page_size: u64, total: u64) -> Self {
        let page_count = if page_size == 0 {
            0
        } else {
            total.div_ceil(page_size)
        };
        Self {
            page,
            page_size,
            page_count,
            total,
        }
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.page_count
    }
}

/// The result of [`StorageAdapter::query`](crate::StorageAdapter::query):
/// a page of records and, when the query was paged, pagination metadata.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub records: Vec<Record>,
    pub pagination: Option<PaginationMeta>,
}

impl QueryResult {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            pagination: None,
        }
    }

    pub fn paged(records: Vec<Record>, meta: PaginationMeta) -> Self {
        Self {
            records,
            pagination: Some(meta),
        }
    }
}
