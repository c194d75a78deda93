//! Tests for `src/webhook/mod.rs` — the HTTP ingress contract: JSON and
//! form payloads accepted, 200 on everything.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use armitage::message::{Channel, Direction, Message, MessageStatus};
use armitage::provider::LogNotifier;
use armitage::store::Store;
use armitage::webhook;
use armitage::webhook::reconciler::Reconciler;

/// Spawn the ingress router on an ephemeral port; returns its base URL.
async fn spawn_ingress(store: Store) -> String {
    let reconciler = Arc::new(Reconciler::new(
        store,
        Arc::new(LogNotifier),
        Duration::from_secs(86_400),
    ));
    let app = webhook::router(reconciler);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("ephemeral port should bind");
    let addr = listener.local_addr().expect("local addr should resolve");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });
    format!("http://{addr}")
}

async fn setup() -> (Store, String) {
    let store = Store::open_in_memory()
        .await
        .expect("in-memory store should open");
    let base = spawn_ingress(store.clone()).await;
    (store, base)
}

fn sent_message(provider_id: &str) -> Message {
    let now = Utc::now();
    Message {
        id: Uuid::new_v4(),
        direction: Direction::Outbound,
        channel: Channel::Sms,
        destination: "+15550100".to_owned(),
        body: "hello".to_owned(),
        status: MessageStatus::Sent,
        scheduled_at: Some(now),
        template_id: None,
        template_params: None,
        provider_id: Some(provider_id.to_owned()),
        retry_count: 0,
        last_error: None,
        conversation_id: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn json_callback_is_applied() {
    let (store, base) = setup().await;
    let message = sent_message("pm-json");
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/webhooks/provider"))
        .json(&serde_json::json!({
            "providerMessageId": "pm-json",
            "eventKind": "delivered",
        }))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.expect("body should be JSON");
    assert_eq!(body["status"], "applied");

    let stored = store
        .message(message.id)
        .await
        .expect("lookup should succeed")
        .expect("message should exist");
    assert_eq!(stored.status, MessageStatus::Delivered);
}

#[tokio::test]
async fn form_encoded_callback_is_applied() {
    let (store, base) = setup().await;
    let message = sent_message("pm-form");
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/webhooks/provider"))
        .form(&[
            ("provider_message_id", "pm-form"),
            ("event", "read"),
        ])
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(resp.status(), 200);

    let stored = store
        .message(message.id)
        .await
        .expect("lookup should succeed")
        .expect("message should exist");
    assert_eq!(stored.status, MessageStatus::Read);
}

#[tokio::test]
async fn malformed_payload_still_answers_200() {
    let (_store, base) = setup().await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/webhooks/provider"))
        .header("content-type", "application/json")
        .body("{not json at all")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(resp.status(), 200, "broken payloads must not trigger provider retries");
    let body: serde_json::Value = resp.json().await.expect("body should be JSON");
    assert_eq!(body["status"], "discarded");
}

#[tokio::test]
async fn unknown_event_kind_still_answers_200() {
    let (_store, base) = setup().await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/webhooks/provider"))
        .json(&serde_json::json!({
            "provider_message_id": "pm-1",
            "event": "exploded",
        }))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.expect("body should be JSON");
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn health_endpoint_answers_ok() {
    let (_store, base) = setup().await;

    let resp = reqwest::get(format!("{base}/health"))
        .await
        .expect("request should succeed");
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.expect("body should be JSON");
    assert_eq!(body["status"], "ok");
}
