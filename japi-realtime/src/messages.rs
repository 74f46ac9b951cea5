//! The subscription channel's wire messages, JSON-encoded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use japi_core::WriteKind;

/// One subscription request, as sent in `subscribe` and repeated inside
/// `restore-subscriptions` after a reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub resource: String,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Client-chosen id. Subscribing twice with the same id replaces the
    /// prior subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

impl SubscribeRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filters: BTreeMap::new(),
            include: Vec::new(),
            fields: BTreeMap::new(),
            subscription_id: None,
        }
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.filters.insert(name.into(), value);
        self
    }

    pub fn with_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = Some(id.into());
        self
    }
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    #[serde(rename_all = "camelCase")]
    Unsubscribe { subscription_id: String },
    RestoreSubscriptions { subscriptions: Vec<SubscribeRequest> },
}

/// A change notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub resource: String,
    pub id: String,
    pub subscription_id: String,
    /// Present on deletes: `{ "id": … }`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_record: Option<Value>,
    pub meta: NotificationMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMeta {
    pub timestamp: DateTime<Utc>,
}

/// Server → client frames. Change notifications carry
/// `type = "resource.<op>d"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { connection_id: String },
    #[serde(rename = "subscription.created", rename_all = "camelCase")]
    SubscriptionCreated {
        subscription_id: String,
        resource: String,
    },
    #[serde(rename = "subscription.error", rename_all = "camelCase")]
    SubscriptionError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        message: String,
    },
    #[serde(rename = "resource.posted")]
    ResourcePosted(Notification),
    #[serde(rename = "resource.patched")]
    ResourcePatched(Notification),
    #[serde(rename = "resource.replaced")]
    ResourceReplaced(Notification),
    #[serde(rename = "resource.deleted")]
    ResourceDeleted(Notification),
}

impl ServerMessage {
    /// Wrap a notification under the event type for the write kind.
    pub fn notification(kind: WriteKind, notification: Notification) -> Self {
        match kind {
            WriteKind::Post => ServerMessage::ResourcePosted(notification),
            WriteKind::Patch => ServerMessage::ResourcePatched(notification),
            WriteKind::Put => ServerMessage::ResourceReplaced(notification),
            WriteKind::Delete => ServerMessage::ResourceDeleted(notification),
        }
    }

    /// The notification payload, when this frame is one.
    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            ServerMessage::ResourcePosted(n)
            | ServerMessage::ResourcePatched(n)
            | ServerMessage::ResourceReplaced(n)
            | ServerMessage::ResourceDeleted(n) => Some(n),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_use_kebab_case_tags() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "subscribe",
            "resource": "articles",
            "filters": {"author_id": 7},
            "subscriptionId": "s1",
        }))
        .unwrap();
        let ClientMessage::Subscribe(request) = msg else {
            panic!("expected subscribe");
        };
        assert_eq!(request.resource, "articles");
        assert_eq!(request.subscription_id.as_deref(), Some("s1"));

        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "restore-subscriptions", "subscriptions": []}))
                .unwrap();
        assert!(matches!(msg, ClientMessage::RestoreSubscriptions { .. }));
    }

    #[test]
    fn notifications_carry_the_event_type() {
        let frame = ServerMessage::notification(
            WriteKind::Post,
            Notification {
                resource: "articles".into(),
                id: "1".into(),
                subscription_id: "s1".into(),
                deleted_record: None,
                meta: NotificationMeta {
                    timestamp: Utc::now(),
                },
            },
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "resource.posted");
        assert_eq!(value["subscriptionId"], "s1");
        assert!(value.get("deletedRecord").is_none());
    }

    #[test]
    fn delete_notifications_carry_the_deleted_id() {
        let frame = ServerMessage::notification(
            WriteKind::Delete,
            Notification {
                resource: "articles".into(),
                id: "9".into(),
                subscription_id: "s1".into(),
                deleted_record: Some(json!({"id": "9"})),
                meta: NotificationMeta {
                    timestamp: Utc::now(),
                },
            },
        );
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "resource.deleted");
        assert_eq!(value["deletedRecord"]["id"], "9");
    }
}
