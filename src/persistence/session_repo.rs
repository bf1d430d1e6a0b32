//! Session summary repository for `SQLite` persistence.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::session::{PermissionMode, Session, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;

/// Persisted summary of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Local session id.
    pub id: String,
    /// Working directory.
    pub project_path: PathBuf,
    /// Model, when one was chosen.
    pub model: Option<String>,
    /// Configured permission mode.
    pub permission_mode: PermissionMode,
    /// Agent resumption id from the last completed exchange.
    pub resume_id: Option<String>,
    /// Lifecycle status at the time of writing.
    pub status: SessionStatus,
    /// Accumulated cost in USD.
    pub total_cost_usd: f64,
    /// Accumulated duration in milliseconds.
    pub total_duration_ms: u64,
    /// Completed exchanges.
    pub exchange_count: u64,
    /// Last failure description.
    pub last_error: Option<String>,
    /// Session creation time.
    pub created_at: DateTime<Utc>,
    /// Time of this write.
    pub updated_at: DateTime<Utc>,
    /// Set once the session reaches `Stopped`.
    pub stopped_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Summary of `session` as of now.
    #[must_use]
    pub fn from_session(session: &Session) -> Self {
        let now = Utc::now();
        Self {
            id: session.id.clone(),
            project_path: session.config.project_path.clone(),
            model: session.config.model.clone(),
            permission_mode: session.config.permission_mode,
            resume_id: session.resume_id.clone(),
            status: session.status,
            total_cost_usd: session.total_cost_usd,
            total_duration_ms: session.total_duration_ms,
            exchange_count: session.exchange_count,
            last_error: session.last_error.clone(),
            created_at: session.created_at,
            updated_at: now,
            stopped_at: (session.status == SessionStatus::Stopped).then_some(now),
        }
    }
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    project_path: String,
    model: Option<String>,
    permission_mode: String,
    resume_id: Option<String>,
    status: String,
    total_cost_usd: f64,
    total_duration_ms: i64,
    exchange_count: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
    stopped_at: Option<String>,
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord> {
        let permission_mode = self
            .permission_mode
            .parse::<PermissionMode>()
            .map_err(|err| AppError::Db(format!("invalid permission_mode: {err}")))?;
        let status = self.status.parse::<SessionStatus>()?;

        Ok(SessionRecord {
            id: self.id,
            project_path: PathBuf::from(self.project_path),
            model: self.model,
            permission_mode,
            resume_id: self.resume_id,
            status,
            total_cost_usd: self.total_cost_usd,
            total_duration_ms: u64::try_from(self.total_duration_ms).unwrap_or(0),
            exchange_count: u64::try_from(self.exchange_count).unwrap_or(0),
            last_error: self.last_error,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            stopped_at: self
                .stopped_at
                .as_deref()
                .map(|raw| parse_timestamp("stopped_at", raw))
                .transpose()?,
        })
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

const SELECT_COLUMNS: &str = "SELECT id, project_path, model, permission_mode, resume_id, status,
        total_cost_usd, total_duration_ms, exchange_count, last_error,
        created_at, updated_at, stopped_at
     FROM conversation";

/// Repository for session summaries.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

impl std::fmt::Debug for SessionRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRepo").finish_non_exhaustive()
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the record for `record.id`.
    ///
    /// A previously recorded `stopped_at` is kept when the new record has none
    /// and the session is still stopped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation (id, project_path, model, permission_mode, resume_id,
                 status, total_cost_usd, total_duration_ms, exchange_count, last_error,
                 created_at, updated_at, stopped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                 model = excluded.model,
                 permission_mode = excluded.permission_mode,
                 resume_id = excluded.resume_id,
                 status = excluded.status,
                 total_cost_usd = excluded.total_cost_usd,
                 total_duration_ms = excluded.total_duration_ms,
                 exchange_count = excluded.exchange_count,
                 last_error = excluded.last_error,
                 updated_at = excluded.updated_at,
                 stopped_at = CASE
                     WHEN excluded.status = 'stopped'
                         THEN COALESCE(conversation.stopped_at, excluded.stopped_at)
                     ELSE NULL
                 END",
        )
        .bind(&record.id)
        .bind(record.project_path.to_string_lossy().into_owned())
        .bind(&record.model)
        .bind(record.permission_mode.as_str())
        .bind(&record.resume_id)
        .bind(record.status.as_str())
        .bind(record.total_cost_usd)
        .bind(to_i64(record.total_duration_ms))
        .bind(to_i64(record.exchange_count))
        .bind(&record.last_error)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.stopped_at.map(|ts| ts.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is corrupt.
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(SessionRow::into_record).transpose()
    }

    /// Records for one working directory, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is corrupt.
    pub async fn list_for_project(&self, project_path: &str) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE project_path = ?1 ORDER BY created_at DESC"
        ))
        .bind(project_path)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(SessionRow::into_record).collect()
    }

    /// Records that carry a resumption id, most recently updated first,
    /// optionally restricted to one working directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is corrupt.
    pub async fn list_resumable(&self, project_path: Option<&str>) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE resume_id IS NOT NULL AND (?1 IS NULL OR project_path = ?1)
             ORDER BY updated_at DESC"
        ))
        .bind(project_path)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(SessionRow::into_record).collect()
    }

    /// Delete stopped sessions whose `stopped_at` is before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_stopped_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM conversation WHERE status = 'stopped' AND stopped_at < ?1",
        )
        .bind(cutoff.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
