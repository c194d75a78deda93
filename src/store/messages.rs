//! Message, event, conversation, and idempotency-window persistence.
//!
//! Status changes are conditional updates guarded by the expected current
//! status (and, for retry, the expected retry count); callers treat a zero
//! `rows_affected` as a lost race and skip. The dispatch claim is a single
//! `UPDATE ... RETURNING` so that no two scheduler ticks, in this process
//! or another, ever hold the same message.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::trace;
use uuid::Uuid;

use super::{fmt_ts, parse_ts, parse_uuid, Store, StoreError};
use crate::message::{
    Channel, Direction, EventKind, Message, MessageEvent, MessageStatus,
};

/// Columns selected/returned for a full [`Message`] row.
const MESSAGE_COLUMNS: &str = "id, direction, channel, destination, body, status, scheduled_at, \
     template_id, template_params, provider_id, retry_count, last_error, \
     conversation_id, created_at, updated_at";

fn message_from_row(row: &SqliteRow) -> Result<Message, StoreError> {
    let id: String = row.try_get("id")?;
    let direction: String = row.try_get("direction")?;
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    let scheduled_at: Option<String> = row.try_get("scheduled_at")?;
    let template_id: Option<String> = row.try_get("template_id")?;
    let template_params: Option<String> = row.try_get("template_params")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Message {
        id: parse_uuid("id", &id)?,
        direction: Direction::parse(&direction)?,
        channel: Channel::parse(&channel)?,
        destination: row.try_get("destination")?,
        body: row.try_get("body")?,
        status: MessageStatus::parse(&status)?,
        scheduled_at: scheduled_at
            .as_deref()
            .map(|s| parse_ts("scheduled_at", s))
            .transpose()?,
        template_id: template_id
            .as_deref()
            .map(|s| parse_uuid("template_id", s))
            .transpose()?,
        template_params: template_params
            .as_deref()
            .map(|s| {
                serde_json::from_str(s).map_err(|_| StoreError::InvalidColumn {
                    field: "template_params",
                    value: s.to_owned(),
                })
            })
            .transpose()?,
        provider_id: row.try_get("provider_id")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        conversation_id: row.try_get("conversation_id")?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<MessageEvent, StoreError> {
    let message_id: String = row.try_get("message_id")?;
    let kind: String = row.try_get("kind")?;
    let occurred_at: String = row.try_get("occurred_at")?;
    let payload: Option<String> = row.try_get("payload")?;

    Ok(MessageEvent {
        id: row.try_get("id")?,
        message_id: parse_uuid("message_id", &message_id)?,
        kind: EventKind::parse(&kind)?,
        occurred_at: parse_ts("occurred_at", &occurred_at)?,
        payload: payload
            .as_deref()
            .map(|s| {
                serde_json::from_str(s).map_err(|_| StoreError::InvalidColumn {
                    field: "payload",
                    value: s.to_owned(),
                })
            })
            .transpose()?,
        error: row.try_get("error")?,
    })
}

impl Store {
    /// Persist a new message row.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure (including a duplicate id).
    pub async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let params_json = message
            .template_params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|_| StoreError::InvalidColumn {
                field: "template_params",
                value: String::new(),
            })?;
        sqlx::query(
            "INSERT INTO messages (id, direction, channel, destination, body, status, \
             scheduled_at, template_id, template_params, provider_id, retry_count, \
             last_error, conversation_id, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(message.id.to_string())
        .bind(message.direction.as_str())
        .bind(message.channel.as_str())
        .bind(&message.destination)
        .bind(&message.body)
        .bind(message.status.as_str())
        .bind(message.scheduled_at.map(fmt_ts))
        .bind(message.template_id.map(|id| id.to_string()))
        .bind(params_json)
        .bind(&message.provider_id)
        .bind(message.retry_count)
        .bind(&message.last_error)
        .bind(message.conversation_id)
        .bind(fmt_ts(message.created_at))
        .bind(fmt_ts(message.updated_at))
        .execute(self.pool())
        .await?;
        trace!(id = %message.id, "message inserted");
        Ok(())
    }

    /// Fetch a message by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Fetch a message by its provider-assigned identifier.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn message_by_provider_id(
        &self,
        provider_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE provider_id = ?1");
        let row = sqlx::query(&sql)
            .bind(provider_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Atomically claim due messages for dispatch.
    ///
    /// Selects outbound `pending` messages whose due time has arrived and
    /// whose retry count is below `max_retries`, oldest due first, at most
    /// `batch` rows, optionally restricted to one channel, and in the same
    /// statement leases them by pushing `scheduled_at` to `lease_until`.
    /// A claimed message is invisible to other ticks until the lease
    /// expires, so a crash between claim and provider call re-dispatches
    /// (documented at-least-once).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        max_retries: i64,
        batch: i64,
        channel: Option<Channel>,
    ) -> Result<Vec<Message>, StoreError> {
        let channel_clause = if channel.is_some() {
            " AND channel = ?5"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE messages SET scheduled_at = ?1, updated_at = ?2 \
             WHERE id IN (\
                SELECT id FROM messages \
                WHERE direction = 'outbound' AND status = 'pending' \
                  AND scheduled_at <= ?2 AND retry_count < ?3{channel_clause} \
                ORDER BY scheduled_at ASC \
                LIMIT ?4) \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let mut query = sqlx::query(&sql)
            .bind(fmt_ts(lease_until))
            .bind(fmt_ts(now))
            .bind(max_retries)
            .bind(batch);
        if let Some(ch) = channel {
            query = query.bind(ch.as_str());
        }
        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Transition a claimed message to `sent`, recording the provider id.
    ///
    /// Returns `false` if the message was concurrently transitioned out of
    /// `pending` (lost race; the caller skips).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn mark_sent(
        &self,
        id: Uuid,
        provider_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'sent', provider_id = ?2, last_error = NULL, \
             updated_at = ?3 \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id.to_string())
        .bind(provider_id)
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition a claimed message to `failed` after a transient error,
    /// incrementing the retry count (clamped to `max_retries` so the
    /// invariant `retry_count <= max` holds).
    ///
    /// Returns `false` on a lost race.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        max_retries: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'failed', \
             retry_count = MIN(retry_count + 1, ?3), last_error = ?2, updated_at = ?4 \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id.to_string())
        .bind(error)
        .bind(max_retries)
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transition a claimed message to `failed` with retries exhausted
    /// immediately: permanent provider errors and precondition failures
    /// bypass backoff entirely.
    ///
    /// Returns `false` on a lost race.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn mark_failed_permanent(
        &self,
        id: Uuid,
        error: &str,
        max_retries: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'failed', retry_count = ?3, last_error = ?2, \
             updated_at = ?4 \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id.to_string())
        .bind(error)
        .bind(max_retries)
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reschedule a failed message back to `pending` at `due`.
    ///
    /// Issued only by the retry controller. Guarded by the retry count the
    /// controller read (idempotent under concurrent sweeps) and re-checked
    /// against `max_retries`.
    ///
    /// Returns `false` if the message is no longer failed, the count moved,
    /// or retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn reschedule_failed(
        &self,
        id: Uuid,
        expected_retry_count: i64,
        max_retries: i64,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'pending', scheduled_at = ?2, updated_at = ?3 \
             WHERE id = ?1 AND status = 'failed' \
               AND retry_count = ?4 AND retry_count < ?5",
        )
        .bind(id.to_string())
        .bind(fmt_ts(due))
        .bind(fmt_ts(now))
        .bind(expected_retry_count)
        .bind(max_retries)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Failed outbound messages still eligible for retry, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn failed_eligible(
        &self,
        max_retries: i64,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE direction = 'outbound' AND status = 'failed' AND retry_count < ?1 \
             ORDER BY updated_at ASC LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(max_retries)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Apply a reconciler-mapped status transition, guarded by the status
    /// the legality check ran against.
    ///
    /// Returns `false` on a lost race (the caller records the event anyway
    /// and leaves the status to the concurrent winner).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn apply_status(
        &self,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE messages SET status = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status = ?2",
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append an event to a message's audit log.
    ///
    /// Events are recorded unconditionally, including for ignored
    /// transitions, and are never updated or deleted.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn record_event(&self, event: &MessageEvent) -> Result<(), StoreError> {
        let payload_json = event
            .payload
            .as_ref()
            .map(serde_json::Value::to_string);
        sqlx::query(
            "INSERT INTO message_events (message_id, kind, occurred_at, payload, error) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(event.message_id.to_string())
        .bind(event.kind.as_str())
        .bind(fmt_ts(event.occurred_at))
        .bind(payload_json)
        .bind(&event.error)
        .execute(self.pool())
        .await?;
        trace!(message = %event.message_id, kind = event.kind.as_str(), "event recorded");
        Ok(())
    }

    /// A message's event log in append order.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn events(&self, message_id: Uuid) -> Result<Vec<MessageEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, message_id, kind, occurred_at, payload, error \
             FROM message_events WHERE message_id = ?1 ORDER BY id ASC",
        )
        .bind(message_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Insert an inbound message, ignoring duplicates on provider id.
    ///
    /// Returns `false` if a message with the same provider id already
    /// exists (a provider redelivery that outlived the dedup window).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn insert_inbound(&self, message: &Message) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages (id, direction, channel, destination, body, \
             status, provider_id, retry_count, conversation_id, created_at, updated_at) \
             VALUES (?1, 'inbound', ?2, ?3, ?4, 'received', ?5, 0, ?6, ?7, ?7)",
        )
        .bind(message.id.to_string())
        .bind(message.channel.as_str())
        .bind(&message.destination)
        .bind(&message.body)
        .bind(&message.provider_id)
        .bind(message.conversation_id)
        .bind(fmt_ts(message.created_at))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Find or create the conversation for a remote address.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn ensure_conversation(
        &self,
        remote_address: &str,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        sqlx::query(
            "INSERT INTO conversations (remote_address, channel, created_at) \
             VALUES (?1, ?2, ?3) ON CONFLICT (remote_address) DO NOTHING",
        )
        .bind(remote_address)
        .bind(channel.as_str())
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        let row: (i64,) =
            sqlx::query_as("SELECT id FROM conversations WHERE remote_address = ?1")
                .bind(remote_address)
                .fetch_one(self.pool())
                .await?;
        Ok(row.0)
    }

    /// Record a webhook idempotency key.
    ///
    /// Returns `true` if the key is fresh within the recency window (or was
    /// last seen before `window_cutoff` and has been re-armed); `false` if
    /// this is a duplicate delivery.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn mark_webhook_key(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window_cutoff: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO webhook_keys (key, seen_at) VALUES (?1, ?2) \
             ON CONFLICT (key) DO UPDATE SET seen_at = excluded.seen_at \
             WHERE webhook_keys.seen_at <= ?3",
        )
        .bind(key)
        .bind(fmt_ts(now))
        .bind(fmt_ts(window_cutoff))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Purge idempotency keys older than the recency window.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn purge_webhook_keys(
        &self,
        window_cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM webhook_keys WHERE seen_at <= ?1")
            .bind(fmt_ts(window_cutoff))
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Count messages with the given status.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn count_messages_by_status(
        &self,
        status: MessageStatus,
    ) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM messages WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(self.pool())
            .await?;
        // count(*) is always non-negative, safe to cast.
        Ok(row.0.cast_unsigned())
    }
}
