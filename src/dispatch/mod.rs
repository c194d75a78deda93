//! Dispatch scheduler: periodic loops that drive pending messages to the
//! provider.
//!
//! One loop runs per configured queue, each as a background Tokio task
//! ticking at its own interval. A tick atomically claims a batch of due
//! messages, fans the sends out under a shared concurrency gate, and sweeps
//! failed messages through the retry policy. Claims are leases: two ticks,
//! in this process or another, never dispatch the same message twice
//! concurrently.

pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use self::retry::{RetryDecision, RetryPolicy};
use crate::config::QueueConfig;
use crate::message::{EventKind, Message, MessageEvent, MessageStatus};
use crate::provider::{Notifier, SendError, Sender};
use crate::store::{Store, StoreError};
use crate::template;

/// How many failed messages one sweep pass examines.
const SWEEP_LIMIT: i64 = 200;

/// Shared dependencies for the dispatch loops.
pub struct DispatcherDeps {
    /// Message store.
    pub store: Store,
    /// Outbound transmission capability.
    pub sender: Arc<dyn Sender>,
    /// Live state-change publisher.
    pub notifier: Arc<dyn Notifier>,
    /// Retry eligibility and backoff.
    pub policy: RetryPolicy,
    /// Global cap on concurrent provider calls, shared across queues.
    pub limiter: Arc<Semaphore>,
    /// How long a claim lease hides a message from other ticks.
    pub claim_lease: Duration,
}

/// Counters from a single dispatch tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Messages claimed for dispatch.
    pub claimed: usize,
    /// Sends accepted by the provider.
    pub sent: usize,
    /// Sends that failed (transient or permanent).
    pub failed: usize,
    /// Failed messages rescheduled by the retry sweep.
    pub rescheduled: usize,
}

/// Outcome of dispatching one claimed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Sent,
    Failed,
    Skipped,
}

/// Run one dispatch loop until shutdown.
///
/// Ticks every `queue.interval_secs`. Exits when the shutdown signal is
/// received or the watch channel closes; an in-flight tick completes first,
/// so in-flight provider calls are never aborted.
pub async fn run_dispatcher(
    queue: QueueConfig,
    deps: Arc<DispatcherDeps>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        queue = %queue.name,
        interval_secs = queue.interval_secs,
        batch = queue.batch_size,
        "dispatcher started"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(queue.interval_secs.max(1)));
    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match run_tick(&deps, &queue).await {
                    Ok(stats) if stats.claimed > 0 || stats.rescheduled > 0 => {
                        info!(
                            queue = %queue.name,
                            claimed = stats.claimed,
                            sent = stats.sent,
                            failed = stats.failed,
                            rescheduled = stats.rescheduled,
                            "dispatch tick completed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(queue = %queue.name, error = %e, "dispatch tick failed");
                    }
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!(queue = %queue.name, "dispatcher shutting down");
                    break;
                }
            }
        }
    }

    info!(queue = %queue.name, "dispatcher stopped");
}

/// Execute a single dispatch tick: claim, send, sweep.
///
/// Exposed for tests and for one-shot draining.
///
/// # Errors
///
/// Returns an error if the claim or sweep query fails; per-message send
/// failures are folded into the stats, not propagated.
pub async fn run_tick(
    deps: &Arc<DispatcherDeps>,
    queue: &QueueConfig,
) -> Result<TickStats, StoreError> {
    let now = Utc::now();
    let lease_until = chrono::Duration::from_std(deps.claim_lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);

    let claimed = deps
        .store
        .claim_due(
            now,
            lease_until,
            i64::from(deps.policy.max_attempts),
            queue.batch_size,
            queue.channel,
        )
        .await?;

    let mut stats = TickStats {
        claimed: claimed.len(),
        ..TickStats::default()
    };

    let mut set = JoinSet::new();
    for message in claimed {
        let deps = Arc::clone(deps);
        set.spawn(async move { dispatch_one(&deps, message).await });
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(DispatchOutcome::Sent) => stats.sent = stats.sent.saturating_add(1),
            Ok(DispatchOutcome::Failed) => stats.failed = stats.failed.saturating_add(1),
            Ok(DispatchOutcome::Skipped) => {}
            Err(e) => error!(error = %e, "dispatch task panicked"),
        }
    }

    stats.rescheduled = sweep_failed(deps).await?;

    Ok(stats)
}

/// Dispatch one claimed message: recheck preconditions, call the provider
/// under the concurrency gate, and fold the result into message state.
async fn dispatch_one(deps: &Arc<DispatcherDeps>, message: Message) -> DispatchOutcome {
    let permit = match deps.limiter.acquire().await {
        Ok(permit) => permit,
        // Semaphore closed: shutdown in progress.
        Err(_) => return DispatchOutcome::Skipped,
    };

    // Preconditions re-checked at dispatch time: they may have changed
    // since enqueue (e.g. a template archived). Violations are permanent.
    if message.destination.trim().is_empty() {
        drop(permit);
        return fail_permanent(deps, &message, "missing destination").await;
    }

    let send_result = match message.template_id {
        Some(template_id) => {
            let content_ref = match sendable_content_ref(deps, template_id).await {
                Ok(content_ref) => content_ref,
                Err(reason) => {
                    drop(permit);
                    return fail_permanent(deps, &message, &reason).await;
                }
            };
            let params = message.template_params.clone().unwrap_or_default();
            deps.sender
                .send_template(message.channel, &message.destination, &content_ref, &params)
                .await
        }
        None => {
            deps.sender
                .send(message.channel, &message.destination, &message.body)
                .await
        }
    };
    drop(permit);

    match send_result {
        Ok(provider_id) => {
            match deps.store.mark_sent(message.id, &provider_id, Utc::now()).await {
                Ok(true) => {
                    record_event(deps, message.id, EventKind::Sent, None).await;
                    publish_status(deps, message.id, MessageStatus::Sent).await;
                    DispatchOutcome::Sent
                }
                Ok(false) => {
                    // Someone else transitioned the message mid-send. The
                    // provider accepted it; at-least-once applies.
                    warn!(id = %message.id, "message transitioned concurrently during send");
                    DispatchOutcome::Skipped
                }
                Err(e) => {
                    error!(id = %message.id, error = %e, "failed to record send result");
                    DispatchOutcome::Skipped
                }
            }
        }
        Err(SendError::Permanent { code, message: detail }) => {
            fail_permanent(deps, &message, &format!("[{code}] {detail}")).await
        }
        Err(SendError::Transient(detail)) => {
            let max = i64::from(deps.policy.max_attempts);
            match deps
                .store
                .mark_failed(message.id, &detail, max, Utc::now())
                .await
            {
                Ok(true) => {
                    record_event(deps, message.id, EventKind::Failed, Some(&detail)).await;
                    publish_status(deps, message.id, MessageStatus::Failed).await;
                    DispatchOutcome::Failed
                }
                Ok(false) => DispatchOutcome::Skipped,
                Err(e) => {
                    error!(id = %message.id, error = %e, "failed to record send failure");
                    DispatchOutcome::Skipped
                }
            }
        }
    }
}

/// Resolve the content reference for a template send, or the reason it is
/// not dispatchable.
async fn sendable_content_ref(
    deps: &Arc<DispatcherDeps>,
    template_id: Uuid,
) -> Result<String, String> {
    match deps.store.template(template_id).await {
        Ok(Some(template)) => match template.content_ref {
            Some(content_ref) if template.status == template::TemplateStatus::Approved => {
                Ok(content_ref)
            }
            Some(_) => Err(format!(
                "template {} not approved (status: {})",
                template_id,
                template.status.as_str()
            )),
            None => Err(format!("template {template_id} has no content reference")),
        },
        Ok(None) => Err(format!("unknown template: {template_id}")),
        Err(e) => Err(format!("template lookup failed: {e}")),
    }
}

async fn fail_permanent(
    deps: &Arc<DispatcherDeps>,
    message: &Message,
    reason: &str,
) -> DispatchOutcome {
    let max = i64::from(deps.policy.max_attempts);
    match deps
        .store
        .mark_failed_permanent(message.id, reason, max, Utc::now())
        .await
    {
        Ok(true) => {
            warn!(id = %message.id, reason, "message failed permanently");
            record_event(deps, message.id, EventKind::Failed, Some(reason)).await;
            publish_status(deps, message.id, MessageStatus::Failed).await;
            DispatchOutcome::Failed
        }
        Ok(false) => DispatchOutcome::Skipped,
        Err(e) => {
            error!(id = %message.id, error = %e, "failed to record permanent failure");
            DispatchOutcome::Skipped
        }
    }
}

/// Sweep failed messages still eligible for retry back to `pending` with
/// backoff. Uses the same policy as the operator retry path.
async fn sweep_failed(deps: &Arc<DispatcherDeps>) -> Result<usize, StoreError> {
    let now = Utc::now();
    let max = i64::from(deps.policy.max_attempts);
    let eligible = deps.store.failed_eligible(max, SWEEP_LIMIT).await?;

    let mut rescheduled: usize = 0;
    for message in eligible {
        match deps.policy.evaluate(message.retry_count, now) {
            RetryDecision::Reschedule { due } => {
                let applied = deps
                    .store
                    .reschedule_failed(message.id, message.retry_count, max, due, now)
                    .await?;
                if applied {
                    record_event(deps, message.id, EventKind::Queued, None).await;
                    publish_status(deps, message.id, MessageStatus::Pending).await;
                    rescheduled = rescheduled.saturating_add(1);
                }
            }
            RetryDecision::Exhausted => {}
        }
    }
    Ok(rescheduled)
}

async fn record_event(
    deps: &Arc<DispatcherDeps>,
    message_id: Uuid,
    kind: EventKind,
    error: Option<&str>,
) {
    let event = MessageEvent {
        id: None,
        message_id,
        kind,
        occurred_at: Utc::now(),
        payload: None,
        error: error.map(str::to_owned),
    };
    if let Err(e) = deps.store.record_event(&event).await {
        error!(id = %message_id, error = %e, "failed to record message event");
    }
}

async fn publish_status(deps: &Arc<DispatcherDeps>, message_id: Uuid, status: MessageStatus) {
    deps.notifier
        .publish(
            "messages",
            serde_json::json!({ "id": message_id, "status": status.as_str() }),
        )
        .await;
}
