//! The subscription registry: per-connection subscription lists, a
//! resource → interested-connections index, filter validation against the
//! search schema, and idempotent restore.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use japi_core::auth::AuthContext;
use japi_core::error::{ApiError, Violation};
use japi_core::schema::ResourceRegistry;

use crate::connection::{Connection, ConnectionId};
use crate::messages::{ClientMessage, ServerMessage, SubscribeRequest};

/// One active subscription on one connection.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub id: String,
    pub resource: String,
    pub filters: std::collections::BTreeMap<String, Value>,
    pub include: Vec<String>,
    pub fields: std::collections::BTreeMap<String, String>,
    pub auth: AuthContext,
    pub created_at: DateTime<Utc>,
}

struct ConnectionState {
    connection: Arc<dyn Connection>,
    /// Creation order: the first matching subscription wins a broadcast.
    subscriptions: Vec<Subscription>,
}

/// Tracks which connection subscribed to what. Linearizable per
/// connection: each entry is updated under its DashMap shard lock.
pub struct SubscriptionRegistry {
    schema: Arc<ResourceRegistry>,
    connections: DashMap<ConnectionId, ConnectionState>,
    by_resource: DashMap<String, HashSet<ConnectionId>>,
    max_subscriptions_per_connection: usize,
}

impl SubscriptionRegistry {
    pub fn new(schema: Arc<ResourceRegistry>) -> Self {
        Self {
            schema,
            connections: DashMap::new(),
            by_resource: DashMap::new(),
            max_subscriptions_per_connection: 32,
        }
    }

    pub fn with_max_subscriptions(mut self, max: usize) -> Self {
        self.max_subscriptions_per_connection = max;
        self
    }

    /// Register a connection. Frames are delivered through it until
    /// [`disconnect`](Self::disconnect).
    pub fn connect(&self, connection: Arc<dyn Connection>) {
        self.connections.insert(
            connection.id(),
            ConnectionState {
                connection,
                subscriptions: Vec::new(),
            },
        );
    }

    /// Drop a connection and all of its subscriptions.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);
        self.by_resource.retain(|_, members| {
            members.remove(&connection_id);
            !members.is_empty()
        });
    }

    /// Record a subscription after validating its filters. Subscribing
    /// twice with the same id replaces the prior subscription, which makes
    /// restore-after-reconnect a plain batch subscribe.
    pub fn subscribe(
        &self,
        connection_id: ConnectionId,
        request: SubscribeRequest,
        auth: AuthContext,
    ) -> Result<Subscription, ApiError> {
        let def = self.schema.require(&request.resource)?;
        let mut violations = Vec::new();
        for name in request.filters.keys() {
            match def.search.get(name) {
                None => violations.push(Violation::new(
                    format!("filters.{name}"),
                    "unknown_filter",
                    format!("No filterable field named {name} on {}", request.resource),
                )),
                Some(field) if !field.supports_record_matching() => {
                    violations.push(Violation::new(
                        format!("filters.{name}"),
                        "unsupported_filter",
                        format!(
                            "{name} has no in-memory predicate and cannot back realtime matching"
                        ),
                    ))
                }
                Some(_) => {}
            }
        }
        if !violations.is_empty() {
            return Err(ApiError::validation(violations));
        }

        let mut state = self
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| ApiError::not_found("Unknown connection"))?;

        let id = request
            .subscription_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let subscription = Subscription {
            id: id.clone(),
            resource: request.resource.clone(),
            filters: request.filters,
            include: request.include,
            fields: request.fields,
            auth,
            created_at: Utc::now(),
        };

        match state.subscriptions.iter_mut().find(|s| s.id == id) {
            Some(existing) => *existing = subscription.clone(),
            None => {
                if state.subscriptions.len() >= self.max_subscriptions_per_connection {
                    return Err(ApiError::violation(
                        "subscriptionId",
                        "max_subscriptions",
                        format!(
                            "At most {} subscriptions per connection",
                            self.max_subscriptions_per_connection
                        ),
                    ));
                }
                state.subscriptions.push(subscription.clone());
            }
        }
        drop(state);

        self.by_resource
            .entry(subscription.resource.clone())
            .or_default()
            .insert(connection_id);
        Ok(subscription)
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, connection_id: ConnectionId, subscription_id: &str) -> bool {
        let Some(mut state) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != subscription_id);
        let removed = state.subscriptions.len() < before;
        let leftover: HashSet<String> = state
            .subscriptions
            .iter()
            .map(|s| s.resource.clone())
            .collect();
        drop(state);

        if removed {
            self.by_resource.retain(|resource, members| {
                if !leftover.contains(resource) {
                    members.remove(&connection_id);
                }
                !members.is_empty()
            });
        }
        removed
    }

    /// Handle one client frame, producing the reply frames to send.
    pub fn handle_message(
        &self,
        connection_id: ConnectionId,
        message: ClientMessage,
        auth: &AuthContext,
    ) -> Vec<ServerMessage> {
        match message {
            ClientMessage::Subscribe(request) => {
                let requested_id = request.subscription_id.clone();
                match self.subscribe(connection_id, request, auth.clone()) {
                    Ok(subscription) => vec![ServerMessage::SubscriptionCreated {
                        subscription_id: subscription.id,
                        resource: subscription.resource,
                    }],
                    Err(err) => vec![ServerMessage::SubscriptionError {
                        subscription_id: requested_id,
                        message: err.to_string(),
                    }],
                }
            }
            ClientMessage::Unsubscribe { subscription_id } => {
                self.unsubscribe(connection_id, &subscription_id);
                Vec::new()
            }
            ClientMessage::RestoreSubscriptions { subscriptions } => subscriptions
                .into_iter()
                .flat_map(|request| {
                    self.handle_message(
                        connection_id,
                        ClientMessage::Subscribe(request),
                        auth,
                    )
                })
                .collect(),
        }
    }

    /// Connections interested in a resource, each with its subscriptions
    /// on that resource in creation order.
    pub fn connections_for(
        &self,
        resource: &str,
    ) -> Vec<(Arc<dyn Connection>, Vec<Subscription>)> {
        let Some(members) = self.by_resource.get(resource) else {
            return Vec::new();
        };
        let ids: Vec<ConnectionId> = members.iter().copied().collect();
        drop(members);

        ids.iter()
            .filter_map(|id| {
                let state = self.connections.get(id)?;
                let subscriptions: Vec<Subscription> = state
                    .subscriptions
                    .iter()
                    .filter(|s| s.resource == resource)
                    .cloned()
                    .collect();
                if subscriptions.is_empty() {
                    None
                } else {
                    Some((state.connection.clone(), subscriptions))
                }
            })
            .collect()
    }

    pub fn subscription_count(&self, connection_id: ConnectionId) -> usize {
        self.connections
            .get(&connection_id)
            .map(|state| state.subscriptions.len())
            .unwrap_or(0)
    }
}
