//! Idempotent reconciliation of provider status callbacks.
//!
//! Every callback is reduced to a stable idempotency key, deduplicated
//! against a bounded recency window, mapped through the message transition
//! table, and appended to the audit log unconditionally, even when the
//! mapped transition is a no-op. Events for one message are folded in
//! arrival order; the legality check is the sole defense against
//! out-of-order delivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{
    transition, Channel, Direction, EventKind, Message, MessageEvent, MessageStatus, Transition,
};
use crate::provider::Notifier;
use crate::store::{Store, StoreError};

/// A provider callback as received by the ingress, JSON or form-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Provider-assigned message identifier.
    #[serde(alias = "providerMessageId")]
    pub provider_message_id: String,
    /// Event kind in the provider's vocabulary
    /// (`sent|delivered|read|failed|queued|received`).
    #[serde(alias = "eventKind", alias = "kind")]
    pub event: String,
    /// Provider error code, present on failure events.
    #[serde(default, alias = "errorCode")]
    pub error_code: Option<String>,
    /// Remote sender address, present on inbound events.
    #[serde(default)]
    pub from: Option<String>,
    /// Message text, present on inbound events.
    #[serde(default)]
    pub body: Option<String>,
    /// Channel hint, present on inbound events.
    #[serde(default)]
    pub channel: Option<String>,
}

/// What reconciling one callback did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A legal transition was applied.
    Applied {
        /// The affected message.
        message_id: Uuid,
        /// The new cached status.
        status: MessageStatus,
    },
    /// The event was recorded for audit but the transition was illegal
    /// (out-of-order or late) or lost a race; status unchanged.
    Recorded {
        /// The affected message.
        message_id: Uuid,
    },
    /// Duplicate delivery inside the recency window; nothing done.
    Duplicate,
    /// No message matches the provider id: a foreign or stale callback,
    /// logged and discarded.
    Unmatched,
    /// An inbound message was created (with its conversation bootstrapped).
    InboundCreated {
        /// The new inbound message.
        message_id: Uuid,
    },
}

impl ReconcileOutcome {
    /// Short label for logs and the ingress response body.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Recorded { .. } => "recorded",
            Self::Duplicate => "duplicate",
            Self::Unmatched => "unmatched",
            Self::InboundCreated { .. } => "inbound_created",
        }
    }
}

/// Errors from reconciliation.
///
/// The ingress logs these and still answers 200; a broken handler must
/// not provoke provider retry storms.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The payload is structurally unusable.
    #[error("malformed webhook payload: {0}")]
    Malformed(String),

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Folds provider callbacks into message state.
pub struct Reconciler {
    store: Store,
    notifier: Arc<dyn Notifier>,
    /// Recency window for idempotency keys.
    window: Duration,
}

impl Reconciler {
    /// Create a reconciler with the given dedup recency window.
    pub fn new(store: Store, notifier: Arc<dyn Notifier>, window: Duration) -> Self {
        Self {
            store,
            notifier,
            window,
        }
    }

    /// Reconcile one callback.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Malformed`] for unusable payloads and
    /// [`ReconcileError::Store`] on persistence failure. Either way the
    /// caller answers the provider with 200.
    pub async fn reconcile(
        &self,
        payload: WebhookPayload,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let kind = EventKind::parse(&payload.event.to_ascii_lowercase())
            .map_err(|e| ReconcileError::Malformed(e.to_string()))?;
        if payload.provider_message_id.trim().is_empty() {
            return Err(ReconcileError::Malformed(
                "empty provider message id".to_owned(),
            ));
        }

        let now = Utc::now();
        let cutoff = window_cutoff(now, self.window);

        let key = idempotency_key(&payload, kind)?;
        if !self.store.mark_webhook_key(&key, now, cutoff).await? {
            debug!(key, "duplicate webhook delivery ignored");
            return Ok(ReconcileOutcome::Duplicate);
        }
        // Keep the window bounded; best-effort.
        if let Err(e) = self.store.purge_webhook_keys(cutoff).await {
            warn!(error = %e, "failed to purge expired idempotency keys");
        }

        if kind == EventKind::Received {
            self.reconcile_inbound(&payload, now).await
        } else {
            self.reconcile_status(&payload, kind, now).await
        }
    }

    /// Fold a delivery-status event into the matching outbound message.
    async fn reconcile_status(
        &self,
        payload: &WebhookPayload,
        kind: EventKind,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(message) = self
            .store
            .message_by_provider_id(&payload.provider_message_id)
            .await?
        else {
            info!(
                provider_id = %payload.provider_message_id,
                event = %payload.event,
                "webhook for unknown provider id discarded"
            );
            return Ok(ReconcileOutcome::Unmatched);
        };

        let raw = serde_json::to_value(payload).ok();
        let event = MessageEvent {
            id: None,
            message_id: message.id,
            kind,
            occurred_at: now,
            payload: raw,
            error: payload.error_code.clone(),
        };

        match transition(message.status, kind) {
            Transition::Apply(next) => {
                let applied = self
                    .store
                    .apply_status(message.id, message.status, next, now)
                    .await?;
                // Audit unconditionally, win or lose.
                self.store.record_event(&event).await?;
                if applied {
                    self.publish(message.id, next).await;
                    Ok(ReconcileOutcome::Applied {
                        message_id: message.id,
                        status: next,
                    })
                } else {
                    warn!(id = %message.id, "webhook transition lost a race; event recorded");
                    Ok(ReconcileOutcome::Recorded {
                        message_id: message.id,
                    })
                }
            }
            Transition::Ignore => {
                self.store.record_event(&event).await?;
                debug!(
                    id = %message.id,
                    status = message.status.as_str(),
                    event = kind.as_str(),
                    "out-of-order or redundant webhook event recorded without transition"
                );
                Ok(ReconcileOutcome::Recorded {
                    message_id: message.id,
                })
            }
        }
    }

    /// Create an inbound message, bootstrapping its conversation.
    async fn reconcile_inbound(
        &self,
        payload: &WebhookPayload,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let from = payload
            .from
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ReconcileError::Malformed("inbound event without sender".to_owned()))?;
        // Inbound traffic arrives on the chat channel unless the provider
        // says otherwise.
        let channel = match payload.channel.as_deref() {
            Some(s) => Channel::parse(s).map_err(|e| ReconcileError::Malformed(e.to_string()))?,
            None => Channel::Chat,
        };

        let conversation_id = self.store.ensure_conversation(from, channel, now).await?;

        let message = Message {
            id: Uuid::new_v4(),
            direction: Direction::Inbound,
            channel,
            destination: from.to_owned(),
            body: payload.body.clone().unwrap_or_default(),
            status: MessageStatus::Received,
            scheduled_at: None,
            template_id: None,
            template_params: None,
            provider_id: Some(payload.provider_message_id.clone()),
            retry_count: 0,
            last_error: None,
            conversation_id: Some(conversation_id),
            created_at: now,
            updated_at: now,
        };

        if !self.store.insert_inbound(&message).await? {
            // Redelivery that outlived the dedup window.
            debug!(
                provider_id = %payload.provider_message_id,
                "inbound message already recorded"
            );
            return Ok(ReconcileOutcome::Duplicate);
        }

        let event = MessageEvent {
            id: None,
            message_id: message.id,
            kind: EventKind::Received,
            occurred_at: now,
            payload: serde_json::to_value(payload).ok(),
            error: None,
        };
        self.store.record_event(&event).await?;
        self.publish(message.id, MessageStatus::Received).await;

        Ok(ReconcileOutcome::InboundCreated {
            message_id: message.id,
        })
    }

    async fn publish(&self, message_id: Uuid, status: MessageStatus) {
        self.notifier
            .publish(
                "messages",
                serde_json::json!({ "id": message_id, "status": status.as_str() }),
            )
            .await;
    }
}

/// Stable idempotency key from the immutable fields of a callback.
///
/// Status events: provider id + kind. Inbound events: provider id + sender
/// + a content hash, since some providers reuse message ids across
/// conversations.
fn idempotency_key(payload: &WebhookPayload, kind: EventKind) -> Result<String, ReconcileError> {
    if kind == EventKind::Received {
        let from = payload
            .from
            .as_deref()
            .ok_or_else(|| ReconcileError::Malformed("inbound event without sender".to_owned()))?;
        let mut hasher = Sha256::new();
        hasher.update(payload.body.as_deref().unwrap_or_default().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Ok(format!(
            "{}:{from}:{digest}",
            payload.provider_message_id
        ))
    } else {
        Ok(format!("{}:{}", payload.provider_message_id, kind.as_str()))
    }
}

/// The oldest `seen_at` still considered inside the recency window.
fn window_cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
