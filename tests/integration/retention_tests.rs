//! Retention purge of stopped session records.

use std::sync::Arc;

use agent_conduit::models::session::{Session, SessionConfig, SessionStatus};
use agent_conduit::persistence::{db, retention, SessionRecord, SessionRepo};
use chrono::{Duration, Utc};

async fn store_session(repo: &SessionRepo, status: SessionStatus, stopped_days_ago: Option<i64>) -> String {
    let mut session = Session::new(SessionConfig::new("/tmp/retention-test"));
    session.status = status;
    let mut record = SessionRecord::from_session(&session);
    record.stopped_at = stopped_days_ago.map(|days| Utc::now() - Duration::days(days));
    repo.upsert(&record).await.expect("upsert");
    session.id
}

#[tokio::test]
async fn purge_removes_only_expired_stopped_sessions() {
    let repo = SessionRepo::new(Arc::new(db::connect_memory().await.expect("db")));

    let expired = store_session(&repo, SessionStatus::Stopped, Some(45)).await;
    let recent = store_session(&repo, SessionStatus::Stopped, Some(2)).await;
    let running = store_session(&repo, SessionStatus::Running, None).await;
    let failed = store_session(&repo, SessionStatus::Error, None).await;

    let purged = retention::purge(&repo, 30).await.expect("purge");
    assert_eq!(purged, 1);

    assert!(repo.get(&expired).await.expect("get").is_none());
    for id in [recent, running, failed] {
        assert!(repo.get(&id).await.expect("get").is_some(), "{id} should remain");
    }
}

#[tokio::test]
async fn retention_task_stops_on_cancel() {
    let repo = SessionRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = retention::spawn_retention_task(repo, 30, cancel.clone());

    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("task exits promptly")
        .expect("join");
}
