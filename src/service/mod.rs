//! Synchronous caller-facing operations: send requests, operator retry,
//! and the template approval workflow.
//!
//! This is the chokepoint for precondition errors: bad input is surfaced
//! here as a [`ServiceError`] and never retried. Everything asynchronous
//! (dispatch, webhooks, provider review) reports through message/template
//! state and the event log instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::dispatch::retry::{RetryDecision, RetryPolicy};
use crate::message::{
    Channel, Direction, EventKind, Message, MessageEvent, MessageStatus,
};
use crate::provider::{Notifier, ProviderError, TemplateDefinition, TemplateProvider};
use crate::store::{Store, StoreError};
use crate::template::{
    self, RequestDecision, Template, TemplateError, TemplateRequest, TemplateStatus,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Precondition and workflow errors surfaced synchronously to callers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Send request without a destination.
    #[error("destination must not be empty")]
    MissingDestination,

    /// Free-text send request without a body.
    #[error("message body must not be empty")]
    EmptyBody,

    /// Send request referencing a template that does not exist.
    #[error("unknown template: {0}")]
    UnknownTemplate(Uuid),

    /// Operation on a message that does not exist.
    #[error("unknown message: {0}")]
    UnknownMessage(Uuid),

    /// Template send while the template is not approved.
    #[error("template {id} is not approved (status: {status})")]
    TemplateNotApproved {
        /// The referenced template.
        id: Uuid,
        /// Its current status.
        status: &'static str,
    },

    /// Template approved but the provider has not built its content
    /// artifact yet.
    #[error("template {0} has no content reference yet")]
    TemplateContentPending(Uuid),

    /// Placeholder validation failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Template name must be unique.
    #[error("template name {0:?} is already in use")]
    NameTaken(String),

    /// Template created without a name.
    #[error("template name must not be empty")]
    EmptyName,

    /// The requested template transition is not legal.
    #[error("illegal template transition: {from} -> {to}")]
    IllegalTransition {
        /// Current status.
        from: &'static str,
        /// Requested status.
        to: &'static str,
    },

    /// Deleting a template outside draft/rejected is an invariant
    /// violation.
    #[error("template may not be deleted while {status}")]
    DeleteForbidden {
        /// Its current status.
        status: &'static str,
    },

    /// Review requested but no submission cycle is open.
    #[error("no pending review request for template {0}")]
    NoPendingRequest(Uuid),

    /// The record changed underneath the operation; safe to retry.
    #[error("record was modified concurrently; retry the operation")]
    ConcurrentModification,

    /// The template provider refused or was unreachable.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Requests / results
// ---------------------------------------------------------------------------

/// A send request.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Transport channel.
    pub channel: Channel,
    /// Destination address.
    pub destination: String,
    /// Free-text body. Ignored for template sends (the body is rendered
    /// from the template).
    pub body: Option<String>,
    /// Optional future send time; `None` means due immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Template to send, if any.
    pub template_id: Option<Uuid>,
    /// Placeholder values for a template send.
    pub params: BTreeMap<String, String>,
}

/// Outcome of an operator retry request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The message was rescheduled.
    Rescheduled {
        /// When the next attempt becomes due.
        due: DateTime<Utc>,
    },
    /// The retry was declined. A no-op, not an error.
    Declined {
        /// Why nothing was done.
        reason: &'static str,
    },
}

/// Message counts by status, for the status CLI and health reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    /// Messages awaiting dispatch.
    pub pending: u64,
    /// Messages accepted by the provider.
    pub sent: u64,
    /// Delivered messages.
    pub delivered: u64,
    /// Read messages.
    pub read: u64,
    /// Failed messages (retrying or exhausted).
    pub failed: u64,
    /// Inbound messages.
    pub received: u64,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Caller-facing operations over the shared store.
pub struct Service {
    store: Store,
    templates: Arc<dyn TemplateProvider>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl Service {
    /// Create a service over the shared store and capabilities.
    pub fn new(
        store: Store,
        templates: Arc<dyn TemplateProvider>,
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            templates,
            notifier,
            policy,
        }
    }

    // -- messages ----------------------------------------------------------

    /// Validate and enqueue a send request.
    ///
    /// Template sends require the template to be approved with a content
    /// reference present, and the params to cover every placeholder; the
    /// rendered body is stored for audit.
    ///
    /// # Errors
    ///
    /// Returns a precondition [`ServiceError`]; these are never retried.
    pub async fn enqueue(&self, request: NewMessage) -> Result<Message, ServiceError> {
        if request.destination.trim().is_empty() {
            return Err(ServiceError::MissingDestination);
        }

        let body = match request.template_id {
            Some(template_id) => {
                let tpl = self
                    .store
                    .template(template_id)
                    .await?
                    .ok_or(ServiceError::UnknownTemplate(template_id))?;
                if tpl.status != TemplateStatus::Approved {
                    return Err(ServiceError::TemplateNotApproved {
                        id: template_id,
                        status: tpl.status.as_str(),
                    });
                }
                if tpl.content_ref.is_none() {
                    return Err(ServiceError::TemplateContentPending(template_id));
                }
                template::render(&tpl.body, &request.params)?
            }
            None => {
                let body = request.body.as_deref().unwrap_or_default().trim();
                if body.is_empty() {
                    return Err(ServiceError::EmptyBody);
                }
                body.to_owned()
            }
        };

        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            direction: Direction::Outbound,
            channel: request.channel,
            destination: request.destination,
            body,
            status: MessageStatus::Pending,
            scheduled_at: Some(request.scheduled_at.unwrap_or(now)),
            template_id: request.template_id,
            template_params: request
                .template_id
                .is_some()
                .then_some(request.params),
            provider_id: None,
            retry_count: 0,
            last_error: None,
            conversation_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_message(&message).await?;
        self.store
            .record_event(&MessageEvent {
                id: None,
                message_id: message.id,
                kind: EventKind::Queued,
                occurred_at: now,
                payload: None,
                error: None,
            })
            .await?;
        info!(id = %message.id, channel = message.channel.as_str(), "message enqueued");
        Ok(message)
    }

    /// Fetch a message.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownMessage`] if it does not exist.
    pub async fn message(&self, id: Uuid) -> Result<Message, ServiceError> {
        self.store
            .message(id)
            .await?
            .ok_or(ServiceError::UnknownMessage(id))
    }

    /// A message's event log in append order.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn events(&self, id: Uuid) -> Result<Vec<MessageEvent>, ServiceError> {
        Ok(self.store.events(id).await?)
    }

    /// Operator retry of a failed message, using the same policy as the
    /// scheduler's sweep.
    ///
    /// Retrying an exhausted (or otherwise unretryable) message is a
    /// declined no-op, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownMessage`] if the message does not
    /// exist, or a store error.
    pub async fn retry(&self, id: Uuid) -> Result<RetryOutcome, ServiceError> {
        let message = self.message(id).await?;
        if message.direction != Direction::Outbound
            || message.status != MessageStatus::Failed
        {
            return Ok(RetryOutcome::Declined {
                reason: "message is not in a failed state",
            });
        }

        let now = Utc::now();
        match self.policy.evaluate(message.retry_count, now) {
            RetryDecision::Exhausted => Ok(RetryOutcome::Declined {
                reason: "retries exhausted",
            }),
            RetryDecision::Reschedule { due } => {
                let applied = self
                    .store
                    .reschedule_failed(
                        id,
                        message.retry_count,
                        i64::from(self.policy.max_attempts),
                        due,
                        now,
                    )
                    .await?;
                if !applied {
                    return Ok(RetryOutcome::Declined {
                        reason: "message was modified concurrently",
                    });
                }
                self.store
                    .record_event(&MessageEvent {
                        id: None,
                        message_id: id,
                        kind: EventKind::Queued,
                        occurred_at: now,
                        payload: None,
                        error: None,
                    })
                    .await?;
                info!(%id, due = %due, "message rescheduled by operator retry");
                self.notifier
                    .publish(
                        "messages",
                        serde_json::json!({ "id": id, "status": MessageStatus::Pending.as_str() }),
                    )
                    .await;
                Ok(RetryOutcome::Rescheduled { due })
            }
        }
    }

    /// Message counts by status.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn queue_stats(&self) -> Result<QueueStats, ServiceError> {
        Ok(QueueStats {
            pending: self
                .store
                .count_messages_by_status(MessageStatus::Pending)
                .await?,
            sent: self
                .store
                .count_messages_by_status(MessageStatus::Sent)
                .await?,
            delivered: self
                .store
                .count_messages_by_status(MessageStatus::Delivered)
                .await?,
            read: self
                .store
                .count_messages_by_status(MessageStatus::Read)
                .await?,
            failed: self
                .store
                .count_messages_by_status(MessageStatus::Failed)
                .await?,
            received: self
                .store
                .count_messages_by_status(MessageStatus::Received)
                .await?,
        })
    }

    // -- templates ---------------------------------------------------------

    /// Create a template in draft.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::EmptyName`] or [`ServiceError::NameTaken`]
    /// on bad input.
    pub async fn create_template(&self, name: &str, body: &str) -> Result<Template, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::EmptyName);
        }
        if self.store.template_by_name(name).await?.is_some() {
            return Err(ServiceError::NameTaken(name.to_owned()));
        }

        let now = Utc::now();
        let template = Template {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            body: body.to_owned(),
            status: TemplateStatus::Draft,
            external_id: None,
            content_ref: None,
            rejection_reason: None,
            submitted_at: None,
            approved_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_template(&template).await?;
        info!(id = %template.id, name = %template.name, "template created");
        Ok(template)
    }

    /// Fetch a template.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::UnknownTemplate`] if it does not exist.
    pub async fn template(&self, id: Uuid) -> Result<Template, ServiceError> {
        self.store
            .template(id)
            .await?
            .ok_or(ServiceError::UnknownTemplate(id))
    }

    /// Submit a template for review: draft or rejected → pending, opening a
    /// new review request cycle.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::IllegalTransition`] from any other status.
    pub async fn submit_template(
        &self,
        id: Uuid,
        requested_by: &str,
    ) -> Result<Template, ServiceError> {
        let template = self.template(id).await?;
        if !template::transition_allowed(template.status, TemplateStatus::Pending) {
            return Err(ServiceError::IllegalTransition {
                from: template.status.as_str(),
                to: TemplateStatus::Pending.as_str(),
            });
        }

        let now = Utc::now();
        let applied = self
            .store
            .update_template_status(
                id,
                TemplateStatus::Pending,
                template.updated_at,
                now,
                None,
                None,
            )
            .await?;
        if !applied {
            return Err(ServiceError::ConcurrentModification);
        }
        self.store
            .insert_request(&TemplateRequest {
                id: None,
                template_id: id,
                requested_by: requested_by.to_owned(),
                requested_at: now,
                reviewed_by: None,
                decided_at: None,
                decision: RequestDecision::Pending,
                comments: None,
            })
            .await?;
        info!(%id, requested_by, "template submitted for review");
        self.template(id).await
    }

    /// Resolve the newest pending review request.
    ///
    /// Accepting forwards the definition to the external provider (its
    /// review is observed later by the sync job; local status stays
    /// pending). Declining moves the template to rejected with the
    /// comments as the reason.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NoPendingRequest`] if no cycle is open, and
    /// provider errors on a failed submission (the request stays pending
    /// and the review can be retried).
    pub async fn review_template(
        &self,
        id: Uuid,
        reviewer: &str,
        accept: bool,
        comments: Option<&str>,
    ) -> Result<Template, ServiceError> {
        let template = self.template(id).await?;
        let request = self
            .store
            .latest_pending_request(id)
            .await?
            .ok_or(ServiceError::NoPendingRequest(id))?;
        let request_id = request.id.ok_or(ServiceError::NoPendingRequest(id))?;

        let now = Utc::now();
        if accept {
            // Submit to the provider first; a failure leaves the request
            // pending so the review can simply be retried.
            if template.external_id.is_none() {
                let definition = TemplateDefinition {
                    name: template.name.clone(),
                    body: template.body.clone(),
                    placeholders: template::placeholders(&template.body),
                };
                let external_id = self.templates.submit(&definition).await?;
                if !self.store.set_external_id(id, &external_id, now).await? {
                    // Raced with another reviewer who already submitted.
                    info!(%id, "external id already recorded; keeping the original");
                }
            }
            if !self
                .store
                .decide_request(request_id, reviewer, RequestDecision::Accepted, comments, now)
                .await?
            {
                return Err(ServiceError::ConcurrentModification);
            }
            info!(%id, reviewer, "template review accepted; awaiting provider review");
        } else {
            if !self
                .store
                .decide_request(request_id, reviewer, RequestDecision::Declined, comments, now)
                .await?
            {
                return Err(ServiceError::ConcurrentModification);
            }
            let applied = self
                .store
                .update_template_status(
                    id,
                    TemplateStatus::Rejected,
                    template.updated_at,
                    now,
                    Some(comments.unwrap_or("declined by reviewer")),
                    None,
                )
                .await?;
            if !applied {
                return Err(ServiceError::ConcurrentModification);
            }
            info!(%id, reviewer, "template review declined");
            self.notifier
                .publish(
                    "templates",
                    serde_json::json!({
                        "id": id,
                        "status": TemplateStatus::Rejected.as_str(),
                    }),
                )
                .await;
        }
        self.template(id).await
    }

    /// Archive an approved template.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::IllegalTransition`] from any other status.
    pub async fn archive_template(&self, id: Uuid) -> Result<Template, ServiceError> {
        let template = self.template(id).await?;
        if !template::transition_allowed(template.status, TemplateStatus::Archived) {
            return Err(ServiceError::IllegalTransition {
                from: template.status.as_str(),
                to: TemplateStatus::Archived.as_str(),
            });
        }
        let applied = self
            .store
            .update_template_status(
                id,
                TemplateStatus::Archived,
                template.updated_at,
                Utc::now(),
                None,
                None,
            )
            .await?;
        if !applied {
            return Err(ServiceError::ConcurrentModification);
        }
        info!(%id, "template archived");
        self.template(id).await
    }

    /// Delete a template, permitted only in draft or rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::DeleteForbidden`] otherwise; deleting an
    /// approved template is an invariant violation, not a soft failure.
    pub async fn delete_template(&self, id: Uuid) -> Result<(), ServiceError> {
        let template = self.template(id).await?;
        if !template::deletable(template.status) {
            return Err(ServiceError::DeleteForbidden {
                status: template.status.as_str(),
            });
        }
        if !self.store.delete_template(id).await? {
            return Err(ServiceError::ConcurrentModification);
        }
        info!(%id, "template deleted");
        Ok(())
    }
}
