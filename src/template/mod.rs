//! Template domain types, the approval state machine, and placeholder
//! handling.
//!
//! A template moves `draft → pending → {approved, rejected}`, may be
//! resubmitted from `rejected`, and is manually archived from `approved`.
//! Local review (an internal reviewer resolving the newest pending
//! [`TemplateRequest`]) is distinct from the external provider's own review,
//! which the sync job (see [`sync`]) observes by polling.

pub mod sync;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Approval lifecycle status of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    /// Being authored; not yet submitted for review.
    Draft,
    /// Submitted; awaiting internal review and/or the provider's review.
    Pending,
    /// Approved by the external reviewing authority; usable for sends once
    /// the content reference is present.
    Approved,
    /// Rejected by a reviewer or the provider; may be resubmitted.
    Rejected,
    /// Retired. No further transitions.
    Archived,
}

impl TemplateStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Archived => "archived",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, TemplateError> {
        match s {
            "draft" => Ok(Self::Draft),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "archived" => Ok(Self::Archived),
            other => Err(TemplateError::InvalidEnum {
                field: "template status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Decision state of a review request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestDecision {
    /// Awaiting a reviewer.
    Pending,
    /// Reviewer accepted; the template was forwarded to the provider.
    Accepted,
    /// Reviewer declined; the template moved to rejected.
    Declined,
}

impl RequestDecision {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised decision.
    pub fn parse(s: &str) -> Result<Self, TemplateError> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            other => Err(TemplateError::InvalidEnum {
                field: "request decision",
                value: other.to_owned(),
            }),
        }
    }
}

/// A reusable message template with `{{placeholder}}` markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Stable public identifier.
    pub id: Uuid,
    /// Unique human-readable name.
    pub name: String,
    /// Body text with `{{placeholder}}` markers.
    pub body: String,
    /// Current approval status.
    pub status: TemplateStatus,
    /// Provider-assigned identifier, set on first submission and never
    /// cleared.
    pub external_id: Option<String>,
    /// Provider content-artifact reference, produced after approval and
    /// never cleared. Required before template-based sends.
    pub content_ref: Option<String>,
    /// Reason for the most recent rejection.
    pub rejection_reason: Option<String>,
    /// When the template was first submitted to the provider.
    pub submitted_at: Option<DateTime<Utc>>,
    /// When approval was observed.
    pub approved_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time. The sync job's optimistic guard key.
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// Returns `true` if messages referencing this template may be
    /// dispatched: approved with a content reference present.
    pub fn is_sendable(&self) -> bool {
        self.status == TemplateStatus::Approved && self.content_ref.is_some()
    }
}

/// An approval-request record, one per submission cycle of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRequest {
    /// Database row id (`None` for entries not yet persisted).
    pub id: Option<i64>,
    /// The template under review.
    pub template_id: Uuid,
    /// Who submitted the template.
    pub requested_by: String,
    /// When the request was opened.
    pub requested_at: DateTime<Utc>,
    /// Reviewer who resolved the request.
    pub reviewed_by: Option<String>,
    /// When the request was resolved.
    pub decided_at: Option<DateTime<Utc>>,
    /// Decision state.
    pub decision: RequestDecision,
    /// Reviewer comments; doubles as the rejection reason on decline.
    pub comments: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from template domain operations.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// A render call did not supply values for every placeholder.
    #[error("missing values for placeholders: {}", missing.join(", "))]
    MissingPlaceholders {
        /// Placeholder names with no supplied value.
        missing: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// The legal template transitions: submit, review outcomes, resubmit, and
/// manual archival. Everything else — notably `approved → draft` — is
/// forbidden. Single chokepoint for both the approval workflow and the
/// provider sync job.
pub fn transition_allowed(from: TemplateStatus, to: TemplateStatus) -> bool {
    use TemplateStatus as S;

    matches!(
        (from, to),
        (S::Draft, S::Pending)
            | (S::Pending, S::Approved)
            | (S::Pending, S::Rejected)
            | (S::Rejected, S::Pending)
            | (S::Approved, S::Archived)
    )
}

/// Returns `true` if a template in this status may be deleted.
///
/// Deleting an approved template is an invariant violation; pending
/// templates are under review and archived ones are kept for audit.
pub fn deletable(status: TemplateStatus) -> bool {
    matches!(status, TemplateStatus::Draft | TemplateStatus::Rejected)
}

// ---------------------------------------------------------------------------
// Placeholders
// ---------------------------------------------------------------------------

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Extract placeholder names from a template body, in order of first
/// appearance, deduplicated.
pub fn placeholders(body: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in placeholder_re().captures_iter(body) {
        if let Some(name) = cap.get(1) {
            let name = name.as_str();
            if !seen.iter().any(|s: &String| s == name) {
                seen.push(name.to_owned());
            }
        }
    }
    seen
}

/// Substitute placeholder values into a template body.
///
/// # Errors
///
/// Returns [`TemplateError::MissingPlaceholders`] if any placeholder in the
/// body has no value in `params`. Extra params are ignored.
pub fn render(body: &str, params: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let missing: Vec<String> = placeholders(body)
        .into_iter()
        .filter(|name| !params.contains_key(name))
        .collect();
    if !missing.is_empty() {
        return Err(TemplateError::MissingPlaceholders { missing });
    }

    let rendered = placeholder_re().replace_all(body, |cap: &regex::Captures<'_>| {
        cap.get(1)
            .and_then(|name| params.get(name.as_str()))
            .cloned()
            .unwrap_or_default()
    });
    Ok(rendered.into_owned())
}
