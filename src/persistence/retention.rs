//! Retention service for time-based purge of stopped sessions.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::session_repo::SessionRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly and deletes records of sessions that have been
/// stopped for longer than `retention_days`.
#[must_use]
pub fn spawn_retention_task(
    repo: SessionRepo,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&repo, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run one purge pass, returning the number of deleted records.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete fails.
pub async fn purge(repo: &SessionRepo, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let purged = repo.purge_stopped_before(cutoff).await?;
    info!(retention_days, purged, "retention purge completed");
    Ok(purged)
}
