//! Idempotent DDL for the session store.

use crate::Result;

use super::db::Database;

const CONVERSATION_TABLE: &str = "CREATE TABLE IF NOT EXISTS conversation (
    id TEXT PRIMARY KEY NOT NULL,
    project_path TEXT NOT NULL,
    model TEXT,
    permission_mode TEXT NOT NULL,
    resume_id TEXT,
    status TEXT NOT NULL,
    total_cost_usd REAL NOT NULL DEFAULT 0,
    total_duration_ms INTEGER NOT NULL DEFAULT 0,
    exchange_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    stopped_at TEXT
)";

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_conversation_project ON conversation (project_path)",
    "CREATE INDEX IF NOT EXISTS idx_conversation_stopped ON conversation (status, stopped_at)",
];

/// Create tables and indexes when missing.
///
/// # Errors
///
/// Returns `AppError::Db` if any statement fails.
pub async fn bootstrap_schema(db: &Database) -> Result<()> {
    sqlx::query(CONVERSATION_TABLE).execute(db).await?;
    for statement in INDEXES {
        sqlx::query(statement).execute(db).await?;
    }
    Ok(())
}
