//! The post-commit change emission seam between the executor and the
//! realtime broadcaster.
//!
//! The executor publishes one [`ChangeEvent`] per committed write. Events
//! produced inside a transaction carry its handle; the sink buffers those
//! and only releases them when [`commit`](ChangeSink::commit) is called —
//! on [`discard`](ChangeSink::discard) they are dropped. A request must
//! never broadcast before its enclosing transaction commits.

use chrono::{DateTime, Utc};

use japi_data::{Record, TransactionHandle};

/// The write verb behind a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Post,
    Put,
    Patch,
    Delete,
}

impl WriteKind {
    /// The notification type emitted to subscribers.
    pub fn event_type(&self) -> &'static str {
        match self {
            WriteKind::Post => "resource.posted",
            WriteKind::Put => "resource.replaced",
            WriteKind::Patch => "resource.patched",
            WriteKind::Delete => "resource.deleted",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WriteKind::Post => "post",
            WriteKind::Put => "put",
            WriteKind::Patch => "patch",
            WriteKind::Delete => "delete",
        }
    }
}

/// A committed (or about-to-commit, when buffered) write.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: WriteKind,
    pub resource: String,
    pub id: String,
    /// Post-image of the record (the pre-delete snapshot for deletes).
    pub record: Record,
    /// Present when the write ran inside a transaction; the sink buffers
    /// until that transaction commits.
    pub transaction: Option<TransactionHandle>,
    pub occurred_at: DateTime<Utc>,
}

/// Receiver of change events. Implemented by the realtime broadcaster.
#[async_trait::async_trait]
pub trait ChangeSink: Send + Sync {
    /// Accept an event: dispatch inline when it carries no transaction,
    /// buffer otherwise.
    async fn publish(&self, event: ChangeEvent);

    /// The transaction committed: flush its buffered events in insertion
    /// order.
    async fn commit(&self, tx: &TransactionHandle);

    /// The transaction rolled back: drop its buffered events.
    async fn discard(&self, tx: &TransactionHandle);
}
