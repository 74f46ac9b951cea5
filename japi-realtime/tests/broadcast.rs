use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use japi_core::auth::AuthContext;
use japi_core::schema::{RegistryBuilder, ResourceDefinition, ResourceRegistry};
use japi_core::sink::{ChangeEvent, ChangeSink, WriteKind};
use japi_core::FieldSpec;
use japi_data::{CompareOp, Record, TransactionHandle};
use japi_realtime::prelude::*;
use japi_realtime::ClientMessage;

fn schema() -> Arc<ResourceRegistry> {
    Arc::new(
        RegistryBuilder::new()
            .register(
                ResourceDefinition::new("articles")
                    .attribute("title", FieldSpec::string())
                    .attribute("author_id", FieldSpec::integer())
                    .filterable("author_id", CompareOp::Eq)
                    .filterable("title", CompareOp::Like)
                    .custom_filter("near", None),
            )
            .register(ResourceDefinition::new("tags"))
            .freeze()
            .unwrap(),
    )
}

fn event(resource: &str, id: &str, author: i64, tx: Option<TransactionHandle>) -> ChangeEvent {
    let mut record = Record::new();
    record.insert("id".into(), json!(id.parse::<i64>().unwrap()));
    record.insert("author_id".into(), json!(author));
    record.insert("title".into(), json!("hello"));
    ChangeEvent {
        kind: WriteKind::Post,
        resource: resource.to_string(),
        id: id.to_string(),
        record,
        transaction: tx,
        occurred_at: Utc::now(),
    }
}

fn setup() -> (
    Arc<SubscriptionRegistry>,
    ChangeBroadcaster,
    Arc<ChannelConnection>,
    tokio::sync::mpsc::Receiver<ServerMessage>,
) {
    let schema = schema();
    let registry = Arc::new(SubscriptionRegistry::new(schema.clone()));
    let broadcaster = ChangeBroadcaster::new(registry.clone(), schema)
        .with_send_timeout(Duration::from_millis(50));
    let (conn, rx) = ChannelConnection::pair(8);
    let conn = Arc::new(conn);
    registry.connect(conn.clone());
    (registry, broadcaster, conn, rx)
}

#[tokio::test]
async fn matching_subscription_receives_exactly_one_notification() {
    let (registry, broadcaster, conn, mut rx) = setup();
    // Two overlapping subscriptions: only the first match may fire.
    registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles")
                .with_filter("author_id", json!(7))
                .with_subscription_id("s1"),
            AuthContext::anonymous(),
        )
        .unwrap();
    registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles").with_subscription_id("s2"),
            AuthContext::anonymous(),
        )
        .unwrap();

    broadcaster.publish(event("articles", "1", 7, None)).await;

    let frame = rx.recv().await.unwrap();
    let notification = frame.as_notification().unwrap();
    assert_eq!(notification.subscription_id, "s1");
    assert_eq!(notification.id, "1");
    assert!(rx.try_recv().is_err(), "at most one notification per event");
}

#[tokio::test]
async fn non_matching_filters_receive_nothing() {
    let (registry, broadcaster, conn, mut rx) = setup();
    registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles").with_filter("author_id", json!(9)),
            AuthContext::anonymous(),
        )
        .unwrap();

    broadcaster.publish(event("articles", "1", 7, None)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn transactional_events_flush_on_commit_and_drop_on_rollback() {
    let (registry, broadcaster, conn, mut rx) = setup();
    registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles").with_filter("author_id", json!(7)),
            AuthContext::anonymous(),
        )
        .unwrap();

    // Rolled-back transaction: two matching writes, zero notifications.
    let tx = TransactionHandle::new();
    broadcaster.publish(event("articles", "1", 7, Some(tx))).await;
    broadcaster.publish(event("articles", "2", 7, Some(tx))).await;
    broadcaster.discard(&tx).await;
    assert!(rx.try_recv().is_err());

    // Committed transaction: flushed in insertion order.
    let tx = TransactionHandle::new();
    broadcaster.publish(event("articles", "3", 7, Some(tx))).await;
    broadcaster.publish(event("articles", "4", 7, Some(tx))).await;
    broadcaster.commit(&tx).await;

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.as_notification().unwrap().id, "3");
    assert_eq!(second.as_notification().unwrap().id, "4");
}

#[tokio::test]
async fn subscribe_validates_filters_against_the_search_schema() {
    let (registry, _broadcaster, conn, _rx) = setup();

    let err = registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles").with_filter("bogus", json!(1)),
            AuthContext::anonymous(),
        )
        .unwrap_err();
    assert_eq!(err.status(), 422);

    // SQL-only custom filter: no in-memory predicate, no realtime.
    let err = registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles").with_filter("near", json!("50.1,14.4")),
            AuthContext::anonymous(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("in-memory predicate"));

    // Unknown resource.
    let err = registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("ghosts"),
            AuthContext::anonymous(),
        )
        .unwrap_err();
    assert_eq!(err.status(), 404);
}

#[tokio::test]
async fn resubscribing_with_the_same_id_replaces_in_place() {
    let (registry, broadcaster, conn, mut rx) = setup();
    for author in [7, 9] {
        registry
            .subscribe(
                conn.id(),
                SubscribeRequest::new("articles")
                    .with_filter("author_id", json!(author))
                    .with_subscription_id("s1"),
                AuthContext::anonymous(),
            )
            .unwrap();
    }
    assert_eq!(registry.subscription_count(conn.id()), 1);

    // Only the replacement filter applies now.
    broadcaster.publish(event("articles", "1", 7, None)).await;
    assert!(rx.try_recv().is_err());
    broadcaster.publish(event("articles", "2", 9, None)).await;
    assert_eq!(rx.recv().await.unwrap().as_notification().unwrap().id, "2");
}

#[tokio::test]
async fn restore_is_a_batch_subscribe() {
    let (registry, _broadcaster, conn, _rx) = setup();
    let replies = registry.handle_message(
        conn.id(),
        ClientMessage::RestoreSubscriptions {
            subscriptions: vec![
                SubscribeRequest::new("articles").with_subscription_id("s1"),
                SubscribeRequest::new("tags").with_subscription_id("s2"),
                SubscribeRequest::new("ghosts").with_subscription_id("s3"),
            ],
        },
        &AuthContext::anonymous(),
    );
    assert_eq!(replies.len(), 3);
    assert!(matches!(
        replies[0],
        ServerMessage::SubscriptionCreated { .. }
    ));
    assert!(matches!(replies[2], ServerMessage::SubscriptionError { .. }));
    assert_eq!(registry.subscription_count(conn.id()), 2);
}

#[tokio::test]
async fn per_connection_cap_is_enforced() {
    let schema = schema();
    let registry =
        Arc::new(SubscriptionRegistry::new(schema.clone()).with_max_subscriptions(2));
    let (conn, _rx) = ChannelConnection::pair(4);
    let conn = Arc::new(conn);
    registry.connect(conn.clone());

    for n in 0..2 {
        registry
            .subscribe(
                conn.id(),
                SubscribeRequest::new("articles").with_subscription_id(format!("s{n}")),
                AuthContext::anonymous(),
            )
            .unwrap();
    }
    let err = registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles").with_subscription_id("s9"),
            AuthContext::anonymous(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("At most 2"));

    // Same-id replacement is still allowed at the cap.
    registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles").with_subscription_id("s0"),
            AuthContext::anonymous(),
        )
        .unwrap();
}

#[tokio::test]
async fn closed_connections_are_dropped_on_broadcast() {
    let (registry, broadcaster, conn, rx) = setup();
    registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles"),
            AuthContext::anonymous(),
        )
        .unwrap();

    drop(rx);
    broadcaster.publish(event("articles", "1", 7, None)).await;
    assert!(registry.connections_for("articles").is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_client_times_out_but_keeps_its_subscription() {
    let schema = schema();
    let registry = Arc::new(SubscriptionRegistry::new(schema.clone()));
    let broadcaster = ChangeBroadcaster::new(registry.clone(), schema)
        .with_send_timeout(Duration::from_millis(50));
    // Capacity 1: the second undelivered frame blocks the sender.
    let (conn, mut rx) = ChannelConnection::pair(1);
    let conn = Arc::new(conn);
    registry.connect(conn.clone());
    registry
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles"),
            AuthContext::anonymous(),
        )
        .unwrap();

    broadcaster.publish(event("articles", "1", 7, None)).await;
    // The client has not drained; this send times out and is dropped.
    broadcaster.publish(event("articles", "2", 7, None)).await;

    assert_eq!(rx.recv().await.unwrap().as_notification().unwrap().id, "1");
    assert!(rx.try_recv().is_err(), "the timed-out message was dropped");

    // The subscription survives: later events are delivered again.
    broadcaster.publish(event("articles", "3", 7, None)).await;
    assert_eq!(rx.recv().await.unwrap().as_notification().unwrap().id, "3");
}
