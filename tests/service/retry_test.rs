//! Tests for the operator retry path in `src/service/mod.rs`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use armitage::dispatch::retry::RetryPolicy;
use armitage::message::{
    Channel, Direction, EventKind, Message, MessageStatus,
};
use armitage::provider::{
    LogNotifier, ProviderError, TemplateDefinition, TemplateProvider, TemplateReview,
};
use armitage::service::{RetryOutcome, Service, ServiceError};
use armitage::store::Store;

struct NullTemplateProvider;

#[async_trait]
impl TemplateProvider for NullTemplateProvider {
    async fn submit(&self, _definition: &TemplateDefinition) -> Result<String, ProviderError> {
        Err(ProviderError::Rejected("not under test".to_owned()))
    }

    async fn status(&self, _external_id: &str) -> Result<TemplateReview, ProviderError> {
        Err(ProviderError::Rejected("not under test".to_owned()))
    }

    async fn content_reference(
        &self,
        _external_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }
}

async fn setup() -> (Store, Service) {
    let store = Store::open_in_memory()
        .await
        .expect("in-memory store should open");
    let service = Service::new(
        store.clone(),
        Arc::new(NullTemplateProvider),
        Arc::new(LogNotifier),
        RetryPolicy::new(3, Duration::from_secs(60)),
    );
    (store, service)
}

fn failed_message(retry_count: i64) -> Message {
    let now = Utc::now();
    Message {
        id: Uuid::new_v4(),
        direction: Direction::Outbound,
        channel: Channel::Sms,
        destination: "+15550100".to_owned(),
        body: "hello".to_owned(),
        status: MessageStatus::Failed,
        scheduled_at: Some(now),
        template_id: None,
        template_params: None,
        provider_id: None,
        retry_count,
        last_error: Some("timeout".to_owned()),
        conversation_id: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn retry_reschedules_with_backoff_and_audits() {
    let (store, service) = setup().await;
    let message = failed_message(1);
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    let outcome = service.retry(message.id).await.expect("retry should succeed");
    let RetryOutcome::Rescheduled { due } = outcome else {
        panic!("expected reschedule, got {outcome:?}");
    };
    assert!(due > Utc::now(), "backoff must defer the next attempt");

    let stored = store
        .message(message.id)
        .await
        .expect("lookup should succeed")
        .expect("message should exist");
    assert_eq!(stored.status, MessageStatus::Pending);
    assert_eq!(stored.retry_count, 1, "retry does not consume an attempt");

    let events = store.events(message.id).await.expect("events should load");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Queued);
}

#[tokio::test]
async fn retry_of_exhausted_message_is_a_declined_no_op() {
    let (store, service) = setup().await;
    let message = failed_message(3);
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    let outcome = service.retry(message.id).await.expect("retry should succeed");
    assert!(matches!(outcome, RetryOutcome::Declined { .. }));

    // Idempotent: asking again is still a decline, never an error.
    let outcome = service.retry(message.id).await.expect("retry should succeed");
    assert!(matches!(outcome, RetryOutcome::Declined { .. }));

    let stored = store
        .message(message.id)
        .await
        .expect("lookup should succeed")
        .expect("message should exist");
    assert_eq!(stored.status, MessageStatus::Failed);
}

#[tokio::test]
async fn retry_of_non_failed_message_is_declined() {
    let (store, service) = setup().await;
    let mut message = failed_message(0);
    message.status = MessageStatus::Delivered;
    store
        .insert_message(&message)
        .await
        .expect("insert should succeed");

    let outcome = service.retry(message.id).await.expect("retry should succeed");
    assert!(matches!(outcome, RetryOutcome::Declined { .. }));
}

#[tokio::test]
async fn retry_of_unknown_message_is_an_error() {
    let (_store, service) = setup().await;
    let err = service
        .retry(Uuid::new_v4())
        .await
        .expect_err("unknown message should fail");
    assert!(matches!(err, ServiceError::UnknownMessage(_)));
}
