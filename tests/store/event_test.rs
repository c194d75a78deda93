//! Tests for the event log, conversations, and the webhook idempotency
//! window in `src/store/messages.rs`.

use chrono::{Duration, Utc};
use uuid::Uuid;

use armitage::message::{
    Channel, Direction, EventKind, Message, MessageEvent, MessageStatus,
};
use armitage::store::Store;

async fn setup_store() -> Store {
    Store::open_in_memory()
        .await
        .expect("in-memory store should open")
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

fn event(message_id: Uuid, kind: EventKind) -> MessageEvent {
    MessageEvent {
        id: None,
        message_id,
        kind,
        occurred_at: Utc::now(),
        payload: None,
        error: None,
    }
}

#[tokio::test]
async fn events_are_returned_in_append_order() {
    let store = setup_store().await;
    let message = sent_message("pm-1");
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    for kind in [EventKind::Queued, EventKind::Sent, EventKind::Delivered] {
        store
            .record_event(&event(message.id, kind))
            .await
            .expect("record should succeed");
    }

    let events = store
        .events(message.id)
        .await
        .expect("events should load");
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Queued, EventKind::Sent, EventKind::Delivered]
    );
}

#[tokio::test]
async fn message_is_found_by_provider_id() {
    let store = setup_store().await;
    let message = sent_message("pm-lookup");
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    let found = store
        .message_by_provider_id("pm-lookup")
        .await
        .expect("lookup should succeed")
        .expect("message should exist");
    assert_eq!(found.id, message.id);

    let missing = store
        .message_by_provider_id("pm-unknown")
        .await
        .expect("lookup should succeed");
    assert!(missing.is_none());
}

#[tokio::test]
async fn webhook_key_dedup_within_window() {
    let store = setup_store().await;
    let now = Utc::now();
    let cutoff = now - Duration::hours(24);

    assert!(store
        .mark_webhook_key("pm-1:delivered", now, cutoff)
        .await
        .expect("mark should succeed"));
    // Same key inside the window is a duplicate.
    assert!(!store
        .mark_webhook_key("pm-1:delivered", now, cutoff)
        .await
        .expect("mark should succeed"));
    // A different kind for the same provider id is a fresh key.
    assert!(store
        .mark_webhook_key("pm-1:read", now, cutoff)
        .await
        .expect("mark should succeed"));
}

#[tokio::test]
async fn webhook_key_rearms_after_window_expiry() {
    let store = setup_store().await;
    let first_seen = Utc::now();
    store
        .mark_webhook_key("pm-1:delivered", first_seen, first_seen - Duration::hours(24))
        .await
        .expect("mark should succeed");

    // A later delivery whose window cutoff has moved past the first
    // sighting re-arms the key instead of treating it as a duplicate.
    let later = first_seen + Duration::hours(48);
    let cutoff = later - Duration::hours(24);
    assert!(store
        .mark_webhook_key("pm-1:delivered", later, cutoff)
        .await
        .expect("mark should succeed"));
}

#[tokio::test]
async fn expired_webhook_keys_are_purged() {
    let store = setup_store().await;
    let old = Utc::now() - Duration::hours(48);
    store
        .mark_webhook_key("stale-key", old, old - Duration::hours(24))
        .await
        .expect("mark should succeed");

    let purged = store
        .purge_webhook_keys(Utc::now() - Duration::hours(24))
        .await
        .expect("purge should succeed");
    assert_eq!(purged, 1);
}

#[tokio::test]
async fn conversations_are_created_once_per_remote_address() {
    let store = setup_store().await;
    let now = Utc::now();

    let first = store
        .ensure_conversation("+15550123", Channel::Chat, now)
        .await
        .expect("ensure should succeed");
    let second = store
        .ensure_conversation("+15550123", Channel::Chat, now)
        .await
        .expect("ensure should succeed");
    assert_eq!(first, second);

    let other = store
        .ensure_conversation("+15550999", Channel::Chat, now)
        .await
        .expect("ensure should succeed");
    assert_ne!(first, other);
}

#[tokio::test]
async fn inbound_insert_ignores_duplicate_provider_ids() {
    let store = setup_store().await;
    let now = Utc::now();
    let conversation = store
        .ensure_conversation("+15550123", Channel::Chat, now)
        .await
        .expect("ensure should succeed");

    let mut inbound = sent_message("pm-in-1");
    inbound.direction = Direction::Inbound;
    inbound.status = MessageStatus::Received;
    inbound.conversation_id = Some(conversation);

    assert!(store
        .insert_inbound(&inbound)
        .await
        .expect("insert should succeed"));

    let mut replay = inbound.clone();
    replay.id = Uuid::new_v4();
    assert!(!store
        .insert_inbound(&replay)
        .await
        .expect("insert should succeed"));
}

#[tokio::test]
async fn counts_by_status_reflect_stored_messages() {
    let store = setup_store().await;
    store
        .insert_message(&sent_message("pm-1"))
        .await
        .expect("insert should succeed");
    store
        .insert_message(&sent_message("pm-2"))
        .await
        .expect("insert should succeed");

    let sent = store
        .count_messages_by_status(MessageStatus::Sent)
        .await
        .expect("count should succeed");
    assert_eq!(sent, 2);
    let failed = store
        .count_messages_by_status(MessageStatus::Failed)
        .await
        .expect("count should succeed");
    assert_eq!(failed, 0);
}
