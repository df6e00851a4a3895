//! Background task that cleans up stale and expired files

use std::time::Duration;

use chrono::{prelude::Utc, TimeDelta};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::*;

/// Upper bound on records touched per sweep.
const SWEEP_LIMIT: i64 = 100;

/// Bound on the candidate query so a wedged database cannot stall the task.
const SWEEP_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Serialize)]
pub struct SweepStats {
    pub files_deleted: u64,
    pub sessions_expired: u64,
    pub lockout_entries_pruned: u64,
}

/// Async task that runs a cleanup sweep on the configured interval.
///
/// Is started by [main] and runs until the cancellation token fires.
/// Has three responsibilities:
/// 1) Deleting files that are either stale (pending/failed past the max age)
///    or TTL-expired, from both the database and the object store.
/// 2) Garbage-collecting abandoned resumable-upload sessions and their
///    staging files.
/// 3) Pruning dormant entries from the login-lockout ledger.
#[tracing::instrument(level = "info", skip(aps, cancel))]
pub async fn cleanup_task(aps: AppState, cancel: CancellationToken) {
    let interval = Duration::from_secs(aps.conf.cleanup_interval_secs);
    loop {
        // All queries elsewhere check expiry themselves, so a coarse interval
        // is fine; nothing is served from an expired record in the meantime.
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("cleanup task shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match run_sweep(&aps).await {
            Ok(stats) => {
                if stats.files_deleted > 0 || stats.sessions_expired > 0 {
                    tracing::info!(
                        files_deleted = stats.files_deleted,
                        sessions_expired = stats.sessions_expired,
                        "cleanup sweep removed expired data"
                    );
                }
            }
            Err(e) => {
                // This task must not die. If a sweep failed that's critical
                // (which is why we log it) but our best approach is
                // nonetheless to simply try again after a while.
                tracing::error!("cleanup sweep failed: {e}");
            }
        }
    }
}

/// One full cleanup pass. Also invoked synchronously by the admin endpoint.
pub async fn run_sweep(aps: &AppState) -> Result<SweepStats, anyhow::Error> {
    let started = std::time::Instant::now();
    let mut stats = SweepStats::default();

    let now = db::now_ts();
    let stale_cutoff = Utc::now()
        .checked_sub_signed(TimeDelta::hours(aps.conf.cleanup_max_age_hours))
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(db::now_ts);

    let candidates = tokio::time::timeout(
        SWEEP_QUERY_TIMEOUT,
        db::reap_candidates(&aps.db, &stale_cutoff, &now, SWEEP_LIMIT),
    )
    .await
    .map_err(|_| anyhow::anyhow!("candidate query timed out"))??;

    // Delete each file one after the other; a failure on one candidate is
    // logged and must not abort the rest of the sweep.
    for candidate in candidates {
        match delete::cleanup_file(&candidate.id, &candidate.object_key, &aps.db, aps.store.as_ref())
            .await
        {
            Ok(_) => {
                stats.files_deleted += 1;
                tracing::info!(
                    file_id = candidate.id,
                    "file expired and was automatically removed"
                );
            }
            Err(e) => {
                tracing::error!(
                    file_id = candidate.id,
                    "failed to delete file from database / store: {e}"
                );
            }
        }
    }

    // Next up, garbage-collect resumable sessions with no recent activity.
    // Their file records fall back to 'pending' stale handling above once
    // marked failed here.
    let session_cutoff = Utc::now()
        .checked_sub_signed(TimeDelta::hours(aps.conf.resumable_ttl_hours))
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(db::now_ts);

    for session in db::stale_sessions(&aps.db, &session_cutoff).await? {
        let staging = resumable::staging_path(&aps.conf.spool_dir, &session.id);
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session_id = session.id, "failed to remove staging file: {e}");
            }
        }
        if let Err(e) = db::mark_failed(&aps.db, &session.file_id).await {
            tracing::error!(session_id = session.id, "failed to fail file record: {e}");
        }
        match db::delete_session_row(&aps.db, &session.id).await {
            Ok(_) => {
                stats.sessions_expired += 1;
                tracing::info!(
                    session_id = session.id,
                    "abandoned resumable session was removed"
                );
            }
            Err(e) => {
                tracing::error!(session_id = session.id, "failed to delete session row: {e}");
            }
        }
    }

    stats.lockout_entries_pruned = aps.lockout.prune(Utc::now().timestamp()) as u64;

    tracing::info!(
        files_deleted = stats.files_deleted,
        sessions_expired = stats.sessions_expired,
        lockout_entries_pruned = stats.lockout_entries_pruned,
        duration_ms = started.elapsed().as_millis() as u64,
        "cleanup sweep finished"
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FileStatus, NewFile};
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use std::sync::Arc;

    async fn test_state() -> (AppState, Arc<MemoryObjectStore>) {
        let db = db::test_pool().await;
        let store = Arc::new(MemoryObjectStore::new());
        let aps = AppState {
            db,
            store: store.clone(),
            conf: Arc::new(crate::test_config()),
            lockout: Arc::new(lockout::LockoutLedger::new(5, 600, 900)),
            active_uploads: Default::default(),
        };
        (aps, store)
    }

    #[tokio::test]
    async fn sweep_removes_expired_auto_delete_records() {
        let (aps, mem) = test_state().await;
        let user = db::test_user(&aps.db, None).await;

        // A hashed record whose TTL lapsed an hour ago, bytes still in store.
        let id = db::new_id();
        let key = storage::object_key_for(&id);
        db::insert_file(
            &aps.db,
            NewFile {
                id: &id,
                object_key: &key,
                orig_name: "old.txt",
                content_type: "text/plain",
                size_bytes: 5,
                user_id: &user,
                expires_at: Some(
                    (Utc::now() - TimeDelta::hours(1)).to_rfc3339(),
                ),
                auto_delete: true,
                link_password: None,
            },
        )
        .await
        .unwrap();
        db::mark_stored(&aps.db, &id).await.unwrap();
        db::mark_hashed(&aps.db, &id, &"0".repeat(64), 5).await.unwrap();

        mem.insert(&key, b"hello");

        let stats = run_sweep(&aps).await.unwrap();
        assert_eq!(stats.files_deleted, 1);
        assert!(db::fetch_file(&aps.db, &id).await.unwrap().is_none());
        assert!(!mem.contains(&key));
        // No object remains under the reaped key.
        assert!(mem.list("uploads/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_spares_live_records() {
        let (aps, _mem) = test_state().await;
        let user = db::test_user(&aps.db, None).await;
        let live = db::test_file(&aps.db, &user, 5, FileStatus::Hashed).await;
        // Freshly-created pending records are not yet stale either.
        let fresh = db::test_file(&aps.db, &user, 5, FileStatus::Pending).await;

        let stats = run_sweep(&aps).await.unwrap();
        assert_eq!(stats.files_deleted, 0);
        assert!(db::fetch_file(&aps.db, &live).await.unwrap().is_some());
        assert!(db::fetch_file(&aps.db, &fresh).await.unwrap().is_some());
    }
}
