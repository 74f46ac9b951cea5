//! The change broadcaster: receives the executor's change events,
//! buffers those produced inside transactions, and after commit matches
//! each event against subscription filters and delivers at most one
//! notification per connection per event.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, warn};

use japi_core::schema::search::matches_filters;
use japi_core::schema::ResourceRegistry;
use japi_core::sink::{ChangeEvent, ChangeSink, WriteKind};
use japi_data::TransactionHandle;

use crate::messages::{Notification, NotificationMeta, ServerMessage};
use crate::registry::SubscriptionRegistry;

/// Implements the engine's [`ChangeSink`] over a [`SubscriptionRegistry`].
pub struct ChangeBroadcaster {
    subscriptions: Arc<SubscriptionRegistry>,
    schema: Arc<ResourceRegistry>,
    buffers: DashMap<TransactionHandle, Vec<ChangeEvent>>,
    send_timeout: Duration,
}

impl ChangeBroadcaster {
    pub fn new(subscriptions: Arc<SubscriptionRegistry>, schema: Arc<ResourceRegistry>) -> Self {
        Self {
            subscriptions,
            schema,
            buffers: DashMap::new(),
            send_timeout: Duration::from_secs(5),
        }
    }

    /// Per-message delivery timeout for slow clients. A timed-out send
    /// drops the message; the subscription stays intact.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    async fn dispatch(&self, event: &ChangeEvent) {
        let Some(def) = self.schema.get(&event.resource) else {
            return;
        };

        for (connection, subscriptions) in self.subscriptions.connections_for(&event.resource) {
            // First matching subscription wins: one notification per
            // connection per event.
            let matched = subscriptions
                .iter()
                .find(|sub| matches_filters(&def.search, &sub.filters, &event.record));
            let Some(subscription) = matched else {
                continue;
            };

            let message = ServerMessage::notification(
                event.kind,
                Notification {
                    resource: event.resource.clone(),
                    id: event.id.clone(),
                    subscription_id: subscription.id.clone(),
                    deleted_record: (event.kind == WriteKind::Delete)
                        .then(|| json!({ "id": event.id })),
                    meta: NotificationMeta {
                        timestamp: event.occurred_at,
                    },
                },
            );

            match tokio::time::timeout(self.send_timeout, connection.send(&message)).await {
                Ok(Ok(())) => {}
                Ok(Err(_closed)) => {
                    debug!(connection = %connection.id(), "dropping closed connection");
                    self.subscriptions.disconnect(connection.id());
                }
                Err(_elapsed) => {
                    // No retry; the subscription persists unless the
                    // connection itself died.
                    warn!(
                        connection = %connection.id(),
                        resource = %event.resource,
                        "notification send timed out; message dropped"
                    );
                    if !connection.is_open() {
                        self.subscriptions.disconnect(connection.id());
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ChangeSink for ChangeBroadcaster {
    async fn publish(&self, event: ChangeEvent) {
        match event.transaction {
            Some(tx) => self.buffers.entry(tx).or_default().push(event),
            None => self.dispatch(&event).await,
        }
    }

    async fn commit(&self, tx: &TransactionHandle) {
        if let Some((_, events)) = self.buffers.remove(tx) {
            for event in events {
                self.dispatch(&event).await;
            }
        }
    }

    async fn discard(&self, tx: &TransactionHandle) {
        self.buffers.remove(tx);
    }
}
