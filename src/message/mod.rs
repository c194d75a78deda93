//! Message domain types and the delivery state machine.
//!
//! A message's current status is the left-fold of its append-only event log
//! through [`transition`], cached on the message row for fast reads. Every
//! writer (dispatcher, webhook reconciler, retry path) consults the same
//! transition table; there is no other place where legality is decided.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Outbound transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Carrier SMS.
    Sms,
    /// Chat messaging (provider-bridged, e.g. WhatsApp-style).
    Chat,
}

impl Channel {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Chat => "chat",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised channel.
    pub fn parse(s: &str) -> Result<Self, MessageError> {
        match s {
            "sms" => Ok(Self::Sms),
            "chat" => Ok(Self::Chat),
            other => Err(MessageError::InvalidEnum {
                field: "channel",
                value: other.to_owned(),
            }),
        }
    }
}

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Created by a send request, dispatched by the scheduler.
    Outbound,
    /// Created by the webhook reconciler from a received event.
    Inbound,
}

impl Direction {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised direction.
    pub fn parse(s: &str) -> Result<Self, MessageError> {
        match s {
            "outbound" => Ok(Self::Outbound),
            "inbound" => Ok(Self::Inbound),
            other => Err(MessageError::InvalidEnum {
                field: "direction",
                value: other.to_owned(),
            }),
        }
    }
}

/// Delivery lifecycle status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Awaiting dispatch: brand-new, scheduled, or rescheduled for retry.
    Pending,
    /// Accepted by the provider; awaiting delivery callbacks.
    Sent,
    /// Provider reported delivery to the destination.
    Delivered,
    /// Provider reported the destination read the message.
    Read,
    /// Send failed; retried while attempts remain, then terminal.
    Failed,
    /// Inbound message, terminal at creation.
    Received,
}

impl MessageStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::Received => "received",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, MessageError> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            "received" => Ok(Self::Received),
            other => Err(MessageError::InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Kind of a recorded message event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Message accepted by the provider.
    Sent,
    /// Provider delivery report.
    Delivered,
    /// Provider read report.
    Read,
    /// Send or delivery failure.
    Failed,
    /// Inbound message received.
    Received,
    /// Message queued for dispatch (enqueue and retry audit marker).
    Queued,
}

impl EventKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::Received => "received",
            Self::Queued => "queued",
        }
    }

    /// Parse from a SQLite text value or the provider's webhook vocabulary.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised event kind.
    pub fn parse(s: &str) -> Result<Self, MessageError> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            "received" => Ok(Self::Received),
            "queued" => Ok(Self::Queued),
            other => Err(MessageError::InvalidEnum {
                field: "event kind",
                value: other.to_owned(),
            }),
        }
    }
}

/// A notification message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable public identifier.
    pub id: Uuid,
    /// Outbound or inbound.
    pub direction: Direction,
    /// Transport channel.
    pub channel: Channel,
    /// Destination address for outbound rows; remote address for inbound.
    pub destination: String,
    /// Message text. For template messages this is the rendered body kept
    /// for audit; the provider renders from the content reference.
    pub body: String,
    /// Cached current status (left-fold of the event log).
    pub status: MessageStatus,
    /// Due time for dispatch. Always set for outbound rows.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Referenced template, if this is a template send.
    pub template_id: Option<Uuid>,
    /// Placeholder values for a template send.
    pub template_params: Option<BTreeMap<String, String>>,
    /// Provider-assigned identifier. Set iff the provider accepted the
    /// message (outbound) or originated it (inbound).
    pub provider_id: Option<String>,
    /// Number of failed send attempts so far. Never exceeds the configured
    /// maximum.
    pub retry_count: i64,
    /// Error detail from the most recent failure.
    pub last_error: Option<String>,
    /// Conversation this message belongs to (inbound bootstrap).
    pub conversation_id: Option<i64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// An entry in a message's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Database row id (`None` for entries not yet persisted).
    pub id: Option<i64>,
    /// The message this event belongs to.
    pub message_id: Uuid,
    /// Event kind.
    pub kind: EventKind,
    /// When the event was recorded.
    pub occurred_at: DateTime<Utc>,
    /// Raw provider payload, if the event came from a webhook.
    pub payload: Option<serde_json::Value>,
    /// Error detail, for failure events.
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from message domain operations.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// An invalid enum value was read from the database or a payload.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Result of applying an event to a message status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The event is legal from the current status; move to the new status.
    Apply(MessageStatus),
    /// The event is not legal from the current status. It is still recorded
    /// in the event log, but the cached status does not change.
    Ignore,
}

/// The legal-transition table: current status × event kind → next status.
///
/// This is the single chokepoint for delivery state changes. Out-of-order
/// webhook callbacks are defended here and nowhere else: an event that is
/// not legal from the current status is ignored, never applied, so a late
/// `delivered` can never resurrect a terminal `failed`.
///
/// `failed → pending` is deliberately absent; rescheduling a failed
/// message is the retry controller's decision, not an event.
pub fn transition(current: MessageStatus, event: EventKind) -> Transition {
    use EventKind as E;
    use MessageStatus as S;

    match (current, event) {
        (S::Pending, E::Sent) => Transition::Apply(S::Sent),
        (S::Pending, E::Failed) => Transition::Apply(S::Failed),
        (S::Sent, E::Delivered) => Transition::Apply(S::Delivered),
        (S::Sent, E::Read) => Transition::Apply(S::Read),
        (S::Sent, E::Failed) => Transition::Apply(S::Failed),
        // A failure report can arrive after a delivery report.
        (S::Delivered, E::Failed) => Transition::Apply(S::Failed),
        // Queued is an audit marker, never a state change.
        (_, E::Queued) => Transition::Ignore,
        _ => Transition::Ignore,
    }
}

/// Returns `true` if no further transition is possible for this status.
///
/// `failed` is terminal only once retries are exhausted, which depends on
/// the configured maximum, hence the second argument.
pub fn is_terminal(status: MessageStatus, retries_exhausted: bool) -> bool {
    match status {
        MessageStatus::Read | MessageStatus::Received => true,
        MessageStatus::Failed => retries_exhausted,
        // Delivered still admits a late failure report.
        MessageStatus::Delivered | MessageStatus::Pending | MessageStatus::Sent => false,
    }
}
