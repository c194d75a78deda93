//! Template and review-request persistence.
//!
//! Status updates are guarded by the `updated_at` value the caller read
//! (optimistic last-write-wins for the sync job); `external_id` and
//! `content_ref` are write-once; the SQL refuses to overwrite them.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::trace;
use uuid::Uuid;

use super::{fmt_ts, parse_ts, parse_uuid, Store, StoreError};
use crate::template::{RequestDecision, Template, TemplateRequest, TemplateStatus};

/// Columns selected for a full [`Template`] row.
const TEMPLATE_COLUMNS: &str = "id, name, body, status, external_id, content_ref, \
     rejection_reason, submitted_at, approved_at, created_at, updated_at";

fn template_from_row(row: &SqliteRow) -> Result<Template, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let submitted_at: Option<String> = row.try_get("submitted_at")?;
    let approved_at: Option<String> = row.try_get("approved_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Template {
        id: parse_uuid("id", &id)?,
        name: row.try_get("name")?,
        body: row.try_get("body")?,
        status: TemplateStatus::parse(&status)?,
        external_id: row.try_get("external_id")?,
        content_ref: row.try_get("content_ref")?,
        rejection_reason: row.try_get("rejection_reason")?,
        submitted_at: submitted_at
            .as_deref()
            .map(|s| parse_ts("submitted_at", s))
            .transpose()?,
        approved_at: approved_at
            .as_deref()
            .map(|s| parse_ts("approved_at", s))
            .transpose()?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}

fn request_from_row(row: &SqliteRow) -> Result<TemplateRequest, StoreError> {
    let template_id: String = row.try_get("template_id")?;
    let requested_at: String = row.try_get("requested_at")?;
    let decided_at: Option<String> = row.try_get("decided_at")?;
    let decision: String = row.try_get("decision")?;

    Ok(TemplateRequest {
        id: row.try_get("id")?,
        template_id: parse_uuid("template_id", &template_id)?,
        requested_by: row.try_get("requested_by")?,
        requested_at: parse_ts("requested_at", &requested_at)?,
        reviewed_by: row.try_get("reviewed_by")?,
        decided_at: decided_at
            .as_deref()
            .map(|s| parse_ts("decided_at", s))
            .transpose()?,
        decision: RequestDecision::parse(&decision)?,
        comments: row.try_get("comments")?,
    })
}

impl Store {
    /// Persist a new template row.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure (including a duplicate name).
    pub async fn insert_template(&self, template: &Template) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO templates (id, name, body, status, external_id, content_ref, \
             rejection_reason, submitted_at, approved_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(&template.body)
        .bind(template.status.as_str())
        .bind(&template.external_id)
        .bind(&template.content_ref)
        .bind(&template.rejection_reason)
        .bind(template.submitted_at.map(fmt_ts))
        .bind(template.approved_at.map(fmt_ts))
        .bind(fmt_ts(template.created_at))
        .bind(fmt_ts(template.updated_at))
        .execute(self.pool())
        .await?;
        trace!(id = %template.id, name = %template.name, "template inserted");
        Ok(())
    }

    /// Fetch a template by id.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn template(&self, id: Uuid) -> Result<Option<Template>, StoreError> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(template_from_row).transpose()
    }

    /// Fetch a template by its unique name.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn template_by_name(&self, name: &str) -> Result<Option<Template>, StoreError> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE name = ?1");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(template_from_row).transpose()
    }

    /// Templates the sync job should poll: submitted to the provider and
    /// not archived.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn templates_for_sync(&self) -> Result<Vec<Template>, StoreError> {
        let sql = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM templates \
             WHERE external_id IS NOT NULL AND status != 'archived' \
             ORDER BY updated_at ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(self.pool()).await?;
        rows.iter().map(template_from_row).collect()
    }

    /// Update a template's status, guarded by the `updated_at` the caller
    /// read (optimistic last-write-wins). Optionally records a rejection
    /// reason and/or approval time; existing values are kept when `None`.
    ///
    /// Returns `false` if the row changed underneath the caller.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn update_template_status(
        &self,
        id: Uuid,
        to: TemplateStatus,
        guard_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
        rejection_reason: Option<&str>,
        approved_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE templates SET status = ?2, updated_at = ?3, \
             rejection_reason = COALESCE(?4, rejection_reason), \
             approved_at = COALESCE(?5, approved_at) \
             WHERE id = ?1 AND updated_at = ?6",
        )
        .bind(id.to_string())
        .bind(to.as_str())
        .bind(fmt_ts(now))
        .bind(rejection_reason)
        .bind(approved_at.map(fmt_ts))
        .bind(fmt_ts(guard_updated_at))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the provider-assigned external id after first submission.
    ///
    /// Write-once: returns `false` if an external id is already set (it is
    /// never cleared or replaced).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_external_id(
        &self,
        id: Uuid,
        external_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE templates SET external_id = ?2, \
             submitted_at = COALESCE(submitted_at, ?3), updated_at = ?3 \
             WHERE id = ?1 AND external_id IS NULL",
        )
        .bind(id.to_string())
        .bind(external_id)
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the provider content reference once the provider has built
    /// the deliverable artifact.
    ///
    /// Write-once: returns `false` if a reference is already set.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn set_content_ref(
        &self,
        id: Uuid,
        content_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE templates SET content_ref = ?2, updated_at = ?3 \
             WHERE id = ?1 AND content_ref IS NULL",
        )
        .bind(id.to_string())
        .bind(content_ref)
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a template, permitted only while it is draft or rejected.
    ///
    /// Returns `false` if the template is in any other status; the caller
    /// surfaces that as a precondition violation.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn delete_template(&self, id: Uuid) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM template_requests WHERE template_id = ?1")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        let result = sqlx::query(
            "DELETE FROM templates WHERE id = ?1 AND status IN ('draft', 'rejected')",
        )
        .bind(id.to_string())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Open a review request for a submission cycle.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn insert_request(&self, request: &TemplateRequest) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO template_requests (template_id, requested_by, requested_at, \
             reviewed_by, decided_at, decision, comments) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(request.template_id.to_string())
        .bind(&request.requested_by)
        .bind(fmt_ts(request.requested_at))
        .bind(&request.reviewed_by)
        .bind(request.decided_at.map(fmt_ts))
        .bind(request.decision.as_str())
        .bind(&request.comments)
        .execute(self.pool())
        .await?;
        trace!(template = %request.template_id, "review request opened");
        Ok(())
    }

    /// The newest pending review request for a template, and the only
    /// actionable one.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn latest_pending_request(
        &self,
        template_id: Uuid,
    ) -> Result<Option<TemplateRequest>, StoreError> {
        let row = sqlx::query(
            "SELECT id, template_id, requested_by, requested_at, reviewed_by, decided_at, \
             decision, comments \
             FROM template_requests \
             WHERE template_id = ?1 AND decision = 'pending' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(template_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    /// Resolve a review request.
    ///
    /// Returns `false` if the request was already decided (idempotent under
    /// double review).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn decide_request(
        &self,
        request_id: i64,
        reviewed_by: &str,
        decision: RequestDecision,
        comments: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE template_requests SET reviewed_by = ?2, decided_at = ?3, \
             decision = ?4, comments = ?5 \
             WHERE id = ?1 AND decision = 'pending'",
        )
        .bind(request_id)
        .bind(reviewed_by)
        .bind(fmt_ts(now))
        .bind(decision.as_str())
        .bind(comments)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All review requests for a template, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an undecodable row.
    pub async fn requests(&self, template_id: Uuid) -> Result<Vec<TemplateRequest>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, template_id, requested_by, requested_at, reviewed_by, decided_at, \
             decision, comments \
             FROM template_requests WHERE template_id = ?1 ORDER BY id ASC",
        )
        .bind(template_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(request_from_row).collect()
    }
}
