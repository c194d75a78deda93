//! Tests for `src/template/sync.rs` — provider status mapping, optimistic
//! guarding, and content-reference backfill.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use armitage::provider::{
    LogNotifier, ProviderError, ReviewStatus, TemplateDefinition, TemplateProvider,
    TemplateReview,
};
use armitage::store::Store;
use armitage::template::sync::{map_review_status, sync_once, SyncDeps};
use armitage::template::{Template, TemplateStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Provider whose per-external-id review answers are scripted.
#[derive(Default)]
struct ScriptedReviews {
    reviews: Mutex<HashMap<String, TemplateReview>>,
    content_refs: Mutex<HashMap<String, String>>,
    unreachable: Mutex<bool>,
}

impl ScriptedReviews {
    fn set_review(&self, external_id: &str, status: ReviewStatus, reason: Option<&str>) {
        self.reviews
            .lock()
            .expect("lock should not be poisoned")
            .insert(
                external_id.to_owned(),
                TemplateReview {
                    status,
                    reason: reason.map(str::to_owned),
                },
            );
    }

    fn set_content_ref(&self, external_id: &str, content_ref: &str) {
        self.content_refs
            .lock()
            .expect("lock should not be poisoned")
            .insert(external_id.to_owned(), content_ref.to_owned());
    }

    fn set_unreachable(&self, unreachable: bool) {
        *self
            .unreachable
            .lock()
            .expect("lock should not be poisoned") = unreachable;
    }
}

#[async_trait]
impl TemplateProvider for ScriptedReviews {
    async fn submit(&self, _definition: &TemplateDefinition) -> Result<String, ProviderError> {
        Ok("ext-unused".to_owned())
    }

    async fn status(&self, external_id: &str) -> Result<TemplateReview, ProviderError> {
        if *self
            .unreachable
            .lock()
            .expect("lock should not be poisoned")
        {
            return Err(ProviderError::Rejected("connection refused".to_owned()));
        }
        self.reviews
            .lock()
            .expect("lock should not be poisoned")
            .get(external_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownStatus("missing".to_owned()))
    }

    async fn content_reference(
        &self,
        external_id: &str,
    ) -> Result<Option<String>, ProviderError> {
        Ok(self
            .content_refs
            .lock()
            .expect("lock should not be poisoned")
            .get(external_id)
            .cloned())
    }
}

fn pending_template(external_id: &str) -> Template {
    let now = Utc::now();
    Template {
        id: Uuid::new_v4(),
        name: format!("tpl-{}", Uuid::new_v4()),
        body: "Hi {{name}}!".to_owned(),
        status: TemplateStatus::Pending,
        external_id: Some(external_id.to_owned()),
        content_ref: None,
        rejection_reason: None,
        submitted_at: Some(now),
        approved_at: None,
        created_at: now,
        updated_at: now,
    }
}

async fn setup() -> (Store, Arc<ScriptedReviews>, SyncDeps) {
    let store = Store::open_in_memory()
        .await
        .expect("in-memory store should open");
    let provider = Arc::new(ScriptedReviews::default());
    let deps = SyncDeps {
        store: store.clone(),
        provider: Arc::clone(&provider) as Arc<dyn TemplateProvider>,
        notifier: Arc::new(LogNotifier),
    };
    (store, provider, deps)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn provider_approval_is_observed_by_polling() {
    let (store, provider, deps) = setup().await;
    let template = pending_template("ext-1");
    store
        .insert_template(&template)
        .await
        .expect("insert should succeed");
    provider.set_review("ext-1", ReviewStatus::Approved, None);

    let stats = sync_once(&deps).await.expect("sync should succeed");
    assert_eq!(stats.checked, 1);
    assert_eq!(stats.updated, 1);

    let stored = store
        .template(template.id)
        .await
        .expect("lookup should succeed")
        .expect("template should exist");
    assert_eq!(stored.status, TemplateStatus::Approved);
    assert!(stored.approved_at.is_some());
}

#[tokio::test]
async fn repeated_approval_poll_is_a_no_op() {
    let (store, provider, deps) = setup().await;
    let template = pending_template("ext-1");
    store
        .insert_template(&template)
        .await
        .expect("insert should succeed");
    provider.set_review("ext-1", ReviewStatus::Approved, None);

    let first = sync_once(&deps).await.expect("sync should succeed");
    assert_eq!(first.updated, 1);

    let second = sync_once(&deps).await.expect("sync should succeed");
    assert_eq!(second.updated, 0, "second identical poll changes nothing");
}

#[tokio::test]
async fn provider_rejection_records_the_reason() {
    let (store, provider, deps) = setup().await;
    let template = pending_template("ext-1");
    store
        .insert_template(&template)
        .await
        .expect("insert should succeed");
    provider.set_review("ext-1", ReviewStatus::Rejected, Some("policy violation"));

    sync_once(&deps).await.expect("sync should succeed");

    let stored = store
        .template(template.id)
        .await
        .expect("lookup should succeed")
        .expect("template should exist");
    assert_eq!(stored.status, TemplateStatus::Rejected);
    assert_eq!(stored.rejection_reason.as_deref(), Some("policy violation"));
}

#[tokio::test]
async fn unreachable_provider_retains_prior_status() {
    let (store, provider, deps) = setup().await;
    let template = pending_template("ext-1");
    store
        .insert_template(&template)
        .await
        .expect("insert should succeed");
    provider.set_unreachable(true);

    let stats = sync_once(&deps).await.expect("sync should succeed");
    assert_eq!(stats.errors, 1);

    let stored = store
        .template(template.id)
        .await
        .expect("lookup should succeed")
        .expect("template should exist");
    assert_eq!(stored.status, TemplateStatus::Pending, "status unchanged");

    // The next poll succeeds and catches up.
    provider.set_unreachable(false);
    provider.set_review("ext-1", ReviewStatus::Approved, None);
    let stats = sync_once(&deps).await.expect("sync should succeed");
    assert_eq!(stats.updated, 1);
}

#[tokio::test]
async fn content_ref_is_backfilled_after_approval() {
    let (store, provider, deps) = setup().await;
    let template = pending_template("ext-1");
    store
        .insert_template(&template)
        .await
        .expect("insert should succeed");
    provider.set_review("ext-1", ReviewStatus::Approved, None);

    // First pass: approval lands but the artifact is not built yet.
    let stats = sync_once(&deps).await.expect("sync should succeed");
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.backfilled, 0, "no artifact yet");

    // Artifact appears; next pass backfills the reference.
    provider.set_content_ref("ext-1", "ref-99");
    let stats = sync_once(&deps).await.expect("sync should succeed");
    assert_eq!(stats.backfilled, 1);

    let stored = store
        .template(template.id)
        .await
        .expect("lookup should succeed")
        .expect("template should exist");
    assert_eq!(stored.content_ref.as_deref(), Some("ref-99"));
}

#[tokio::test]
async fn in_review_and_pending_map_to_pending() {
    let (store, provider, deps) = setup().await;
    let template = pending_template("ext-1");
    store
        .insert_template(&template)
        .await
        .expect("insert should succeed");
    provider.set_review("ext-1", ReviewStatus::InReview, None);

    let stats = sync_once(&deps).await.expect("sync should succeed");
    assert_eq!(stats.updated, 0, "in_review is still pending locally");
}

#[tokio::test]
async fn archived_templates_are_not_polled() {
    let (store, provider, deps) = setup().await;
    let mut template = pending_template("ext-1");
    template.status = TemplateStatus::Archived;
    store
        .insert_template(&template)
        .await
        .expect("insert should succeed");
    provider.set_review("ext-1", ReviewStatus::Approved, None);

    let stats = sync_once(&deps).await.expect("sync should succeed");
    assert_eq!(stats.checked, 0);
}

#[test]
fn review_vocabulary_maps_onto_local_statuses() {
    assert_eq!(map_review_status(ReviewStatus::Approved), TemplateStatus::Approved);
    assert_eq!(map_review_status(ReviewStatus::Rejected), TemplateStatus::Rejected);
    assert_eq!(map_review_status(ReviewStatus::Disabled), TemplateStatus::Rejected);
    assert_eq!(map_review_status(ReviewStatus::Pending), TemplateStatus::Pending);
    assert_eq!(map_review_status(ReviewStatus::InReview), TemplateStatus::Pending);
    assert_eq!(map_review_status(ReviewStatus::Deleted), TemplateStatus::Archived);
}
