//! Tests for the send-request preconditions in `src/service/mod.rs`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use armitage::dispatch::retry::RetryPolicy;
use armitage::message::{Channel, EventKind, MessageStatus};
use armitage::provider::{
    LogNotifier, ProviderError, TemplateDefinition, TemplateProvider, TemplateReview,
};
use armitage::service::{NewMessage, Service, ServiceError};
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

fn text_request(destination: &str, body: &str) -> NewMessage {
    NewMessage {
        channel: Channel::Sms,
        destination: destination.to_owned(),
        body: Some(body.to_owned()),
        scheduled_at: None,
        template_id: None,
        params: BTreeMap::new(),
    }
}

#[tokio::test]
async fn enqueue_creates_a_pending_message_due_now() {
    let (store, service) = setup().await;
    let before = Utc::now();

    let message = service
        .enqueue(text_request("+15550100", "hello"))
        .await
        .expect("enqueue should succeed");

    assert_eq!(message.status, MessageStatus::Pending);
    assert_eq!(message.retry_count, 0);
    assert!(message.provider_id.is_none());
    let due = message.scheduled_at.expect("due time should be set");
    assert!(due >= before, "unscheduled sends are due immediately");

    let events = store.events(message.id).await.expect("events should load");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Queued);
}

#[tokio::test]
async fn enqueue_honours_a_future_schedule() {
    let (_store, service) = setup().await;
    let later = Utc::now() + ChronoDuration::hours(2);

    let mut request = text_request("+15550100", "hello");
    request.scheduled_at = Some(later);
    let message = service
        .enqueue(request)
        .await
        .expect("enqueue should succeed");
    assert_eq!(message.scheduled_at, Some(later));
}

#[tokio::test]
async fn empty_destination_is_a_precondition_error() {
    let (_store, service) = setup().await;
    let err = service
        .enqueue(text_request("  ", "hello"))
        .await
        .expect_err("empty destination should fail");
    assert!(matches!(err, ServiceError::MissingDestination));
}

#[tokio::test]
async fn empty_body_is_a_precondition_error() {
    let (_store, service) = setup().await;
    let err = service
        .enqueue(text_request("+15550100", "   "))
        .await
        .expect_err("empty body should fail");
    assert!(matches!(err, ServiceError::EmptyBody));
}

#[tokio::test]
async fn unknown_template_is_a_precondition_error() {
    let (_store, service) = setup().await;
    let mut request = text_request("+15550100", "ignored");
    request.template_id = Some(uuid::Uuid::new_v4());
    let err = service
        .enqueue(request)
        .await
        .expect_err("unknown template should fail");
    assert!(matches!(err, ServiceError::UnknownTemplate(_)));
}

#[tokio::test]
async fn queue_stats_count_by_status() {
    let (_store, service) = setup().await;
    service
        .enqueue(text_request("+15550100", "one"))
        .await
        .expect("enqueue should succeed");
    service
        .enqueue(text_request("+15550100", "two"))
        .await
        .expect("enqueue should succeed");

    let stats = service.queue_stats().await.expect("stats should load");
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.sent, 0);
}
