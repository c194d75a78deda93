//! SQLite persistence for messages, events, templates, and the webhook
//! idempotency window.
//!
//! The [`Store`] is the sole gateway to the database. Schema lives in
//! `migrations/*.sql`, applied in order at open. Reads go through the
//! connection pool; every status mutation is a conditional `UPDATE` whose
//! `rows_affected` is checked by the caller, so a lost race between
//! concurrent workers is a skip, not a corruption.
//!
//! Timestamps are RFC 3339 TEXT in a single fixed format (UTC, microsecond
//! precision), which makes lexicographic `<=` in SQL chronological.

pub mod messages;
pub mod templates;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::message::MessageError;
use crate::template::TemplateError;
use uuid::Uuid;

/// Migration files applied in order at open. Mirrors the on-disk
/// `migrations/` directory so tests and the binary share one schema.
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_schema", include_str!("../../migrations/001_schema.sql")),
    ("002_templates", include_str!("../../migrations/002_templates.sql")),
];

/// Database busy timeout — how long a writer waits on a locked database
/// before failing.
const BUSY_TIMEOUT_SECS: u64 = 5;

/// Maximum pool connections. SQLite serializes writes anyway; a small pool
/// keeps concurrent readers cheap.
const MAX_CONNECTIONS: u32 = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration failed to apply.
    #[error("migration {name} failed: {source}")]
    Migration {
        /// Migration file name.
        name: String,
        /// Underlying database error.
        source: sqlx::Error,
    },

    /// A column value could not be decoded into its domain type.
    #[error("invalid {field} value: {value:?}")]
    InvalidColumn {
        /// Which column contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// Message enum decoding failed.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Template enum decoding failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// No message with the given id.
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),

    /// No template with the given id.
    #[error("template not found: {0}")]
    TemplateNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the armitage database.
#[derive(Debug, Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and apply pending
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or a migration
    /// fails.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS));
        let store = Self::open_with(opts).await?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Open an in-memory database with the full schema applied.
    ///
    /// In-memory databases vanish per-connection, so the pool is pinned to
    /// a single connection. Used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or a migration fails.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?
            .foreign_keys(true);
        Self::open_pool(opts, 1).await
    }

    /// Open with explicit connection options and apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or a migration fails.
    pub async fn open_with(opts: SqliteConnectOptions) -> Result<Self, StoreError> {
        Self::open_pool(opts, MAX_CONNECTIONS).await
    }

    async fn open_pool(opts: SqliteConnectOptions, max: u32) -> Result<Self, StoreError> {
        let db = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(opts)
            .await?;
        apply_migrations(&db).await?;
        Ok(Self { db })
    }

    /// Returns a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Close the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.db.close().await;
    }
}

async fn apply_migrations(db: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
            name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
    )
    .execute(db)
    .await?;

    for (name, sql) in MIGRATIONS {
        let applied: Option<(String,)> =
            sqlx::query_as("SELECT name FROM schema_migrations WHERE name = ?1")
                .bind(name)
                .fetch_optional(db)
                .await?;
        if applied.is_some() {
            continue;
        }
        sqlx::raw_sql(sql)
            .execute(db)
            .await
            .map_err(|source| StoreError::Migration {
                name: (*name).to_owned(),
                source,
            })?;
        sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)")
            .bind(name)
            .bind(fmt_ts(Utc::now()))
            .execute(db)
            .await?;
        info!(migration = name, "migration applied");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Format a timestamp for storage. One fixed format everywhere so that SQL
/// string comparison is chronological.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub(crate) fn parse_ts(field: &'static str, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidColumn {
            field,
            value: s.to_owned(),
        })
}

/// Parse a stored UUID.
pub(crate) fn parse_uuid(field: &'static str, s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|_| StoreError::InvalidColumn {
        field,
        value: s.to_owned(),
    })
}
