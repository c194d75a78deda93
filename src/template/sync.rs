//! Periodic reconciliation of template state against the provider.
//!
//! Two concerns, both driven from one polling loop:
//! - map the provider's review status onto local template status, guarded
//!   by an optimistic `updated_at` check so concurrent local writes win;
//! - backfill the provider content reference for approved templates, since
//!   approval and content-build completion are not simultaneous on the
//!   provider side.
//!
//! Provider unreachability is logged; templates keep their prior status and
//! the next poll retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{transition_allowed, Template, TemplateStatus};
use crate::provider::{Notifier, ReviewStatus, TemplateProvider};
use crate::store::{Store, StoreError};

/// Shared dependencies for the sync loop.
pub struct SyncDeps {
    /// Template store.
    pub store: Store,
    /// External reviewing authority.
    pub provider: Arc<dyn TemplateProvider>,
    /// Live state-change publisher.
    pub notifier: Arc<dyn Notifier>,
}

/// Counters from a single sync pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    /// Templates polled.
    pub checked: usize,
    /// Status transitions applied.
    pub updated: usize,
    /// Content references backfilled.
    pub backfilled: usize,
    /// Provider or store errors encountered (polling continued).
    pub errors: usize,
}

/// Run the sync loop until shutdown.
pub async fn run_template_sync(
    interval_secs: u64,
    deps: Arc<SyncDeps>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs, "template sync started");

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match sync_once(&deps).await {
                    Ok(stats) if stats.updated > 0 || stats.backfilled > 0 || stats.errors > 0 => {
                        info!(
                            checked = stats.checked,
                            updated = stats.updated,
                            backfilled = stats.backfilled,
                            errors = stats.errors,
                            "template sync pass completed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "template sync pass failed"),
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("template sync shutting down");
                    break;
                }
            }
        }
    }

    info!("template sync stopped");
}

/// One full sync pass over every template the provider knows about.
///
/// Exposed for tests and the one-shot CLI path.
///
/// # Errors
///
/// Returns an error only if the candidate query fails; per-template
/// provider and store errors are counted and polling continues.
pub async fn sync_once(deps: &SyncDeps) -> Result<SyncStats, StoreError> {
    let candidates = deps.store.templates_for_sync().await?;
    let mut stats = SyncStats {
        checked: candidates.len(),
        ..SyncStats::default()
    };

    for template in candidates {
        match sync_template(deps, &template).await {
            Ok(TemplateSyncEffect::Updated) => {
                stats.updated = stats.updated.saturating_add(1);
            }
            Ok(TemplateSyncEffect::None) => {}
            Err(e) => {
                warn!(template = %template.id, error = %e, "template status poll failed");
                stats.errors = stats.errors.saturating_add(1);
                continue;
            }
        }
        match backfill_content_ref(deps, &template).await {
            Ok(true) => stats.backfilled = stats.backfilled.saturating_add(1),
            Ok(false) => {}
            Err(e) => {
                warn!(template = %template.id, error = %e, "content reference backfill failed");
                stats.errors = stats.errors.saturating_add(1);
            }
        }
    }

    Ok(stats)
}

enum TemplateSyncEffect {
    Updated,
    None,
}

/// Poll one template's provider status and fold it into local state.
async fn sync_template(
    deps: &SyncDeps,
    template: &Template,
) -> Result<TemplateSyncEffect, Box<dyn std::error::Error + Send + Sync>> {
    let Some(external_id) = template.external_id.as_deref() else {
        return Ok(TemplateSyncEffect::None);
    };

    let review = deps.provider.status(external_id).await?;
    let mapped = map_review_status(review.status);

    if mapped == template.status {
        return Ok(TemplateSyncEffect::None);
    }
    if !transition_allowed(template.status, mapped) {
        debug!(
            template = %template.id,
            local = template.status.as_str(),
            provider = mapped.as_str(),
            "provider status change is not a legal local transition; skipped"
        );
        return Ok(TemplateSyncEffect::None);
    }

    let now = Utc::now();
    let approved_at = (mapped == TemplateStatus::Approved).then_some(now);
    let reason = match mapped {
        TemplateStatus::Rejected => Some(
            review
                .reason
                .as_deref()
                .unwrap_or("rejected by provider")
                .to_owned(),
        ),
        _ => None,
    };

    let applied = deps
        .store
        .update_template_status(
            template.id,
            mapped,
            template.updated_at,
            now,
            reason.as_deref(),
            approved_at,
        )
        .await?;

    if !applied {
        // A local write landed since we read the row; last write wins and
        // the next poll re-reconciles.
        debug!(template = %template.id, "template changed during sync; skipped");
        return Ok(TemplateSyncEffect::None);
    }

    info!(
        template = %template.id,
        from = template.status.as_str(),
        to = mapped.as_str(),
        "template status synchronised from provider"
    );
    deps.notifier
        .publish(
            "templates",
            serde_json::json!({ "id": template.id, "status": mapped.as_str() }),
        )
        .await;
    Ok(TemplateSyncEffect::Updated)
}

/// Fetch the content reference for an approved template that lacks one.
async fn backfill_content_ref(
    deps: &SyncDeps,
    template: &Template,
) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    // Re-read: the status may have just been synchronised to approved.
    let Some(current) = deps.store.template(template.id).await? else {
        return Ok(false);
    };
    if current.status != TemplateStatus::Approved || current.content_ref.is_some() {
        return Ok(false);
    }
    let Some(external_id) = current.external_id.as_deref() else {
        return Ok(false);
    };

    match deps.provider.content_reference(external_id).await? {
        Some(content_ref) => {
            let set = deps
                .store
                .set_content_ref(current.id, &content_ref, Utc::now())
                .await?;
            if set {
                info!(template = %current.id, "content reference backfilled");
            }
            Ok(set)
        }
        // Artifact not built yet; the next poll retries.
        None => Ok(false),
    }
}

/// Map the provider's review vocabulary onto local template status.
///
/// `disabled` maps to rejected (actionable — the template can be fixed and
/// resubmitted); `deleted` maps to archived.
pub fn map_review_status(status: ReviewStatus) -> TemplateStatus {
    match status {
        ReviewStatus::Approved => TemplateStatus::Approved,
        ReviewStatus::Rejected | ReviewStatus::Disabled => TemplateStatus::Rejected,
        ReviewStatus::Pending | ReviewStatus::InReview => TemplateStatus::Pending,
        ReviewStatus::Deleted => TemplateStatus::Archived,
    }
}
