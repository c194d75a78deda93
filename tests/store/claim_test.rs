//! Tests for the atomic dispatch claim and status mutations in
//! `src/store/messages.rs`.

use chrono::{Duration, Utc};
use uuid::Uuid;

use armitage::message::{Channel, Direction, Message, MessageStatus};
use armitage::store::Store;

async fn setup_store() -> Store {
    Store::open_in_memory()
        .await
        .expect("in-memory store should open")
}

fn outbound(channel: Channel, due_offset_secs: i64) -> Message {
    let now = Utc::now();
    Message {
        id: Uuid::new_v4(),
        direction: Direction::Outbound,
        channel,
        destination: "+15550100".to_owned(),
        body: "hello".to_owned(),
        status: MessageStatus::Pending,
        scheduled_at: Some(now + Duration::seconds(due_offset_secs)),
        template_id: None,
        template_params: None,
        provider_id: None,
        retry_count: 0,
        last_error: None,
        conversation_id: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn claim_returns_due_messages_and_leases_them() {
    let store = setup_store().await;
    let due_a = outbound(Channel::Sms, -5);
    let due_b = outbound(Channel::Sms, -1);
    let future = outbound(Channel::Sms, 3600);
    for m in [&due_a, &due_b, &future] {
        store.insert_message(m).await.expect("insert should succeed");
    }

    let now = Utc::now();
    let lease = now + Duration::seconds(120);
    let claimed = store
        .claim_due(now, lease, 3, 100, None)
        .await
        .expect("claim should succeed");
    assert_eq!(claimed.len(), 2);

    // Leased messages are invisible to a second claim.
    let again = store
        .claim_due(now, lease, 3, 100, None)
        .await
        .expect("claim should succeed");
    assert!(again.is_empty(), "leased messages must not be re-claimed");
}

#[tokio::test]
async fn claim_selects_oldest_due_first_bounded_by_batch() {
    let store = setup_store().await;
    let oldest = outbound(Channel::Sms, -300);
    let middle = outbound(Channel::Sms, -200);
    let newest = outbound(Channel::Sms, -100);
    for m in [&newest, &oldest, &middle] {
        store.insert_message(m).await.expect("insert should succeed");
    }

    let now = Utc::now();
    let claimed = store
        .claim_due(now, now + Duration::seconds(120), 3, 2, None)
        .await
        .expect("claim should succeed");
    let ids: Vec<Uuid> = claimed.iter().map(|m| m.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&oldest.id), "oldest due message is selected");
    assert!(ids.contains(&middle.id), "next-oldest due message is selected");
    assert!(!ids.contains(&newest.id), "batch bound excludes the newest");
}

#[tokio::test]
async fn claim_respects_channel_filter() {
    let store = setup_store().await;
    let sms = outbound(Channel::Sms, -5);
    let chat = outbound(Channel::Chat, -5);
    for m in [&sms, &chat] {
        store.insert_message(m).await.expect("insert should succeed");
    }

    let now = Utc::now();
    let claimed = store
        .claim_due(now, now + Duration::seconds(120), 3, 100, Some(Channel::Chat))
        .await
        .expect("claim should succeed");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, chat.id);
}

#[tokio::test]
async fn claim_skips_messages_with_exhausted_retries() {
    let store = setup_store().await;
    let mut exhausted = outbound(Channel::Sms, -5);
    exhausted.retry_count = 3;
    store
        .insert_message(&exhausted)
        .await
        .expect("insert should succeed");

    let now = Utc::now();
    let claimed = store
        .claim_due(now, now + Duration::seconds(120), 3, 100, None)
        .await
        .expect("claim should succeed");
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn sequential_claims_never_overlap() {
    let store = setup_store().await;
    for _ in 0..10 {
        store
            .insert_message(&outbound(Channel::Sms, -5))
            .await
            .expect("insert should succeed");
    }

    let now = Utc::now();
    let lease = now + Duration::seconds(120);
    let first = store
        .claim_due(now, lease, 3, 5, None)
        .await
        .expect("claim should succeed");
    let second = store
        .claim_due(now, lease, 3, 5, None)
        .await
        .expect("claim should succeed");

    assert_eq!(first.len(), 5);
    assert_eq!(second.len(), 5);
    for m in &first {
        assert!(
            !second.iter().any(|other| other.id == m.id),
            "message {} claimed twice",
            m.id
        );
    }
}

#[tokio::test]
async fn mark_sent_flips_status_once() {
    let store = setup_store().await;
    let message = outbound(Channel::Sms, -5);
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    let now = Utc::now();
    assert!(store
        .mark_sent(message.id, "pm-123", now)
        .await
        .expect("mark_sent should succeed"));

    let stored = store
        .message(message.id)
        .await
        .expect("lookup should succeed")
        .expect("message should exist");
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(stored.provider_id.as_deref(), Some("pm-123"));

    // A second transition out of pending loses the race.
    assert!(!store
        .mark_sent(message.id, "pm-456", now)
        .await
        .expect("mark_sent should succeed"));
}

#[tokio::test]
async fn mark_failed_increments_and_clamps_retry_count() {
    let store = setup_store().await;
    let mut message = outbound(Channel::Sms, -5);
    message.retry_count = 2;
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    assert!(store
        .mark_failed(message.id, "timeout", 3, Utc::now())
        .await
        .expect("mark_failed should succeed"));
    let stored = store
        .message(message.id)
        .await
        .expect("lookup should succeed")
        .expect("message should exist");
    assert_eq!(stored.status, MessageStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    assert_eq!(stored.last_error.as_deref(), Some("timeout"));

    // Count never exceeds the maximum even on repeated failure paths.
    assert!(stored.retry_count <= 3);
}

#[tokio::test]
async fn mark_failed_permanent_exhausts_retries_immediately() {
    let store = setup_store().await;
    let message = outbound(Channel::Sms, -5);
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    assert!(store
        .mark_failed_permanent(message.id, "[invalid_destination] bad number", 3, Utc::now())
        .await
        .expect("mark_failed_permanent should succeed"));
    let stored = store
        .message(message.id)
        .await
        .expect("lookup should succeed")
        .expect("message should exist");
    assert_eq!(stored.status, MessageStatus::Failed);
    assert_eq!(stored.retry_count, 3);
}

#[tokio::test]
async fn reschedule_failed_is_guarded_by_retry_count() {
    let store = setup_store().await;
    let message = outbound(Channel::Sms, -5);
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");
    store
        .mark_failed(message.id, "timeout", 3, Utc::now())
        .await
        .expect("mark_failed should succeed");

    let now = Utc::now();
    let due = now + Duration::seconds(60);

    // Stale expected count loses.
    assert!(!store
        .reschedule_failed(message.id, 0, 3, due, now)
        .await
        .expect("reschedule should succeed"));
    // Correct expected count wins.
    assert!(store
        .reschedule_failed(message.id, 1, 3, due, now)
        .await
        .expect("reschedule should succeed"));

    let stored = store
        .message(message.id)
        .await
        .expect("lookup should succeed")
        .expect("message should exist");
    assert_eq!(stored.status, MessageStatus::Pending);
}

#[tokio::test]
async fn reschedule_refuses_exhausted_messages() {
    let store = setup_store().await;
    let message = outbound(Channel::Sms, -5);
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");
    store
        .mark_failed_permanent(message.id, "blocked", 3, Utc::now())
        .await
        .expect("mark should succeed");

    let now = Utc::now();
    assert!(!store
        .reschedule_failed(message.id, 3, 3, now, now)
        .await
        .expect("reschedule should succeed"));
}

#[tokio::test]
async fn failed_eligible_excludes_exhausted() {
    let store = setup_store().await;
    let retryable = outbound(Channel::Sms, -5);
    let exhausted = outbound(Channel::Sms, -5);
    for m in [&retryable, &exhausted] {
        store.insert_message(m).await.expect("insert should succeed");
    }
    store
        .mark_failed(retryable.id, "timeout", 3, Utc::now())
        .await
        .expect("mark should succeed");
    store
        .mark_failed_permanent(exhausted.id, "blocked", 3, Utc::now())
        .await
        .expect("mark should succeed");

    let eligible = store
        .failed_eligible(3, 100)
        .await
        .expect("query should succeed");
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].id, retryable.id);
}
