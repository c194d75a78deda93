//! External provider capabilities.
//!
//! Three seams separate the core from the outside world:
//! - [`Sender`] performs the actual transmission of a message;
//! - [`TemplateProvider`] submits template definitions for external review
//!   and reports their status;
//! - [`Notifier`] pushes live state changes to observers, fire-and-forget.
//!
//! [`http::ProviderBridge`] implements all three against the provider
//! bridge's HTTP API. Tests substitute their own implementations.

pub mod http;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::Channel;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failed send attempt.
///
/// The core does not interpret provider error codes beyond the
/// permanent/transient split: permanent failures suppress further retries,
/// transient ones are handed to the retry controller.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The provider signalled an unrecoverable condition for this message.
    #[error("permanent provider failure [{code}]: {message}")]
    Permanent {
        /// Provider error code.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// Network error, timeout, or a retryable provider condition.
    #[error("transient provider failure: {0}")]
    Transient(String),
}

/// Errors from the template provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request to the provider failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered but refused the operation.
    #[error("provider rejected the request: {0}")]
    Rejected(String),

    /// The provider returned a status outside its documented vocabulary.
    #[error("unknown provider status: {0:?}")]
    UnknownStatus(String),
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Performs the actual transmission of a message through the provider.
///
/// Latency and failure are non-deterministic; callers bound concurrency and
/// treat a timeout like any other transient failure.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Send free-text `body` to `destination` on `channel`.
    ///
    /// Returns the provider-assigned message identifier.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Permanent`] for unrecoverable conditions and
    /// [`SendError::Transient`] otherwise.
    async fn send(
        &self,
        channel: Channel,
        destination: &str,
        body: &str,
    ) -> Result<String, SendError>;

    /// Send a template message rendered by the provider from `content_ref`
    /// with the given placeholder values.
    ///
    /// Returns the provider-assigned message identifier.
    ///
    /// # Errors
    ///
    /// Same contract as [`Sender::send`].
    async fn send_template(
        &self,
        channel: Channel,
        destination: &str,
        content_ref: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<String, SendError>;
}

// ---------------------------------------------------------------------------
// Template provider
// ---------------------------------------------------------------------------

/// A template definition as submitted for external review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    /// Unique template name.
    pub name: String,
    /// Body text with `{{placeholder}}` markers.
    pub body: String,
    /// Placeholder names appearing in the body.
    pub placeholders: Vec<String>,
}

/// The provider's review status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Review passed; the template may be used once its content artifact
    /// is built.
    Approved,
    /// Review failed.
    Rejected,
    /// Queued for review.
    Pending,
    /// Actively under review.
    InReview,
    /// Disabled by the provider (e.g. quality enforcement).
    Disabled,
    /// Deleted on the provider side.
    Deleted,
}

impl ReviewStatus {
    /// Parse the provider's wire vocabulary, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownStatus`] for anything outside the
    /// documented vocabulary.
    pub fn parse(s: &str) -> Result<Self, ProviderError> {
        match s.to_ascii_lowercase().as_str() {
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "pending" => Ok(Self::Pending),
            "in_review" => Ok(Self::InReview),
            "disabled" => Ok(Self::Disabled),
            "deleted" => Ok(Self::Deleted),
            other => Err(ProviderError::UnknownStatus(other.to_owned())),
        }
    }
}

/// Review status plus the provider's reason, when it gives one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TemplateReview {
    /// Current provider-side status.
    pub status: ReviewStatus,
    /// Rejection/disable reason, if any.
    pub reason: Option<String>,
}

/// Submits template definitions for review and reports their status.
#[async_trait]
pub trait TemplateProvider: Send + Sync {
    /// Submit a definition for review. Returns the provider-assigned
    /// external template id.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the provider is unreachable or refuses
    /// the submission.
    async fn submit(&self, definition: &TemplateDefinition) -> Result<String, ProviderError>;

    /// Report the current review status for a previously submitted
    /// template.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the provider is unreachable or answers
    /// outside its vocabulary.
    async fn status(&self, external_id: &str) -> Result<TemplateReview, ProviderError>;

    /// Fetch the content-artifact reference for an approved template.
    ///
    /// Returns `None` while the provider is still building the artifact —
    /// approval and content-build completion are not simultaneous.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the provider is unreachable.
    async fn content_reference(&self, external_id: &str) -> Result<Option<String>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Pushes live state changes to observers.
///
/// Fire-and-forget: implementations log failures and never propagate them,
/// so a broken observer can never affect delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: serde_json::Value);
}

/// Notifier that logs published events at debug level.
///
/// The default when no push endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, topic: &str, payload: serde_json::Value) {
        tracing::debug!(topic, %payload, "state change published");
    }
}
