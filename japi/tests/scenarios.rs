//! End-to-end scenarios over the full stack: engine + memory storage +
//! auth builder + subscription broadcaster.

use std::sync::Arc;

use serde_json::json;

use japi::prelude::*;
use japi::OperationKind;
use japi_data_memory::MemoryBackend;

struct Stack {
    engine: Engine,
    subscriptions: Arc<SubscriptionRegistry>,
}

fn broadcast_stack() -> Stack {
    let storage = Arc::new(MemoryBackend::new().with_unique("users", "email"));
    let engine = Engine::builder(storage)
        .resource(
            ResourceDefinition::new("users")
                .attribute("name", FieldSpec::string())
                .attribute("email", FieldSpec::string())
                .attribute("auth0_id", FieldSpec::string())
                .rules(OperationKind::Query, ["public"])
                .rules(OperationKind::Get, ["public"]),
        )
        .resource(
            ResourceDefinition::new("articles")
                .attribute("title", FieldSpec::string().required())
                .belongs_to("author", "users", "author_id")
                .belongs_to("owner", "users", "user_id")
                .ownership(Ownership::Auto)
                .filterable("author_id", CompareOp::Eq)
                .rules(OperationKind::Query, ["public"])
                .rules(OperationKind::Get, ["public"])
                .rules(OperationKind::Post, ["authenticated"])
                .rules(OperationKind::Patch, ["owns"])
                .rules(OperationKind::Delete, ["owns"]),
        )
        .build()
        .unwrap();

    let subscriptions = Arc::new(SubscriptionRegistry::new(engine.registry().clone()));
    let broadcaster = Arc::new(ChangeBroadcaster::new(
        subscriptions.clone(),
        engine.registry().clone(),
    ));
    let engine = engine.with_change_sink(broadcaster);
    Stack {
        engine,
        subscriptions,
    }
}

fn post_article(author: &str) -> Request {
    Request::post(
        "articles",
        json!({"data": {"type": "articles", "attributes": {"title": "T"},
            "relationships": {"author": {"data": {"type": "users", "id": author}}}}}),
    )
    .with_auth(AuthContext::user(author))
}

// ── Seed 5: write broadcasts after commit ───────────────────────────────

#[tokio::test]
async fn broadcasts_fire_after_commit_and_never_after_rollback() {
    let stack = broadcast_stack();
    let engine = &stack.engine;

    let (conn, mut rx) = ChannelConnection::pair(8);
    let conn = Arc::new(conn);
    stack.subscriptions.connect(conn.clone());
    stack
        .subscriptions
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles")
                .with_filter("author_id", json!("7"))
                .with_subscription_id("s1"),
            AuthContext::anonymous(),
        )
        .unwrap();

    // A transaction writes two matching articles and rolls back.
    let tx = engine.begin().await.unwrap();
    for _ in 0..2 {
        engine
            .execute(post_article("7").in_transaction(tx))
            .await
            .unwrap();
    }
    engine.rollback(tx).await.unwrap();
    assert!(rx.try_recv().is_err(), "rollback must suppress broadcasts");

    // The next request commits: exactly one resource.posted arrives.
    let response = engine.execute(post_article("7")).await.unwrap();
    assert_eq!(response.status, 201);

    let frame = rx.recv().await.unwrap();
    let notification = frame.as_notification().unwrap();
    assert_eq!(notification.subscription_id, "s1");
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "resource.posted");
    assert!(rx.try_recv().is_err(), "exactly one notification");

    // A non-matching author stays silent.
    engine.execute(post_article("9")).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn delete_notifications_carry_the_deleted_record_id() {
    let stack = broadcast_stack();
    let engine = &stack.engine;

    let (conn, mut rx) = ChannelConnection::pair(8);
    let conn = Arc::new(conn);
    stack.subscriptions.connect(conn.clone());
    stack
        .subscriptions
        .subscribe(
            conn.id(),
            SubscribeRequest::new("articles").with_subscription_id("s1"),
            AuthContext::anonymous(),
        )
        .unwrap();

    let response = engine.execute(post_article("7")).await.unwrap();
    let id = response.document.unwrap()["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    let _ = rx.recv().await.unwrap(); // the posted frame

    engine
        .execute(Request::delete("articles", &id).with_auth(AuthContext::system()))
        .await
        .unwrap();
    let frame = rx.recv().await.unwrap();
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["type"], "resource.deleted");
    assert_eq!(value["deletedRecord"]["id"], id);
}

// ── Full-stack token flow ───────────────────────────────────────────────

#[tokio::test]
async fn token_login_links_a_user_and_owns_created_records() {
    let storage: Arc<dyn StorageAdapter> =
        Arc::new(MemoryBackend::new().with_unique("users", "email"));

    let verifier = japi_auth::StaticVerifier::new().with_token(
        "alice-token",
        json!({"sub": "auth0|alice", "email": "alice@example.com", "jti": "j1"}),
    );
    let auth_builder = AuthContextBuilder::new(ProviderRegistry::new(
        Provider::new("auth0", Arc::new(verifier)).with_link_by_email(true),
    ))
    .with_user_store(storage.clone());

    let engine = Engine::builder(storage)
        .resource(
            ResourceDefinition::new("users")
                .attribute("name", FieldSpec::string())
                .attribute("email", FieldSpec::string())
                .attribute("auth0_id", FieldSpec::string())
                .rules(OperationKind::Query, ["public"]),
        )
        .resource(
            ResourceDefinition::new("notes")
                .attribute("text", FieldSpec::string())
                .belongs_to("owner", "users", "user_id")
                .ownership(Ownership::Always)
                .rules(OperationKind::Query, ["authenticated"])
                .rules(OperationKind::Get, ["authenticated"])
                .rules(OperationKind::Post, ["authenticated"])
                .rules(OperationKind::Patch, ["owns"]),
        )
        .auth_provider(Arc::new(auth_builder))
        .build()
        .unwrap();

    // First request with the token: the local user is created on the fly
    // and the note is stamped with the linked user id.
    let response = engine
        .execute(
            Request::post(
                "notes",
                json!({"data": {"type": "notes", "attributes": {"text": "hi"}}}),
            )
            .with_token("alice-token", None),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 201);
    let doc = response.document.unwrap();
    assert_eq!(
        doc["data"]["relationships"]["owner"]["data"],
        json!({"type": "users", "id": "1"})
    );

    // A present-but-invalid token is a 401, not anonymous.
    let err = engine
        .execute(
            Request::post(
                "notes",
                json!({"data": {"type": "notes", "attributes": {"text": "nope"}}}),
            )
            .with_token("forged", None),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 401);

    // Another user cannot even see the note.
    let err = engine
        .execute(
            Request::get("notes", "1").with_auth(AuthContext::user("99")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), 404);

    // The owner reads it back through the same token.
    let response = engine
        .execute(Request::get("notes", "1").with_token("alice-token", None))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
}
