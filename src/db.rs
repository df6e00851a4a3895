//! Metadata store: file records, users and resumable-upload sessions

use chrono::{prelude::Utc, DateTime, SubsecRound};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Lifecycle stage of a file record.
///
/// Transitions run strictly forward along pending -> stored -> hashed, with
/// failed reachable from anywhere. `Ready` is kept as a legal stored value for
/// a future publish gate but is treated as an alias of `Hashed` everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Stored,
    Hashed,
    Ready,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Stored => "stored",
            FileStatus::Hashed => "hashed",
            FileStatus::Ready => "ready",
            FileStatus::Failed => "failed",
        }
    }

    /// Bytes may be streamed to downloaders in these states only.
    pub fn is_downloadable(&self) -> bool {
        matches!(self, FileStatus::Hashed | FileStatus::Ready)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FileRecord {
    pub id: String,
    pub object_key: String,
    pub orig_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub sha256_hex: Option<String>,
    pub sha256_bytes: Option<i64>,
    pub user_id: String,
    pub status: FileStatus,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub auto_delete: bool,
    pub link_password: Option<String>,
    pub download_count: i64,
    pub last_downloaded_at: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub email_verified: bool,
    pub is_admin: bool,
    pub storage_quota_bytes: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, FromRow)]
pub struct ResumableSession {
    pub id: String,
    pub file_id: String,
    pub object_key: String,
    pub total_size: i64,
    pub current_offset: i64,
    pub status: SessionStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Current UTC time as the RFC3339 string all timestamp columns use.
///
/// Subseconds are dropped so the strings stay lexicographically comparable,
/// which the reaper's candidate query relies on.
pub fn now_ts() -> String {
    Utc::now().round_subsecs(0).to_rfc3339()
}

/// Check whether an RFC3339 timestamp lies in the past.
pub fn has_expired(ts: &str) -> Result<bool, anyhow::Error> {
    let parsed = DateTime::parse_from_rfc3339(ts)?;
    Ok(parsed < Utc::now())
}

/// Generate a fresh unpredictable identifier for a file or session.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ---- file records -------------------------------------------------------

pub struct NewFile<'a> {
    pub id: &'a str,
    pub object_key: &'a str,
    pub orig_name: &'a str,
    pub content_type: &'a str,
    pub size_bytes: i64,
    pub user_id: &'a str,
    pub expires_at: Option<String>,
    pub auto_delete: bool,
    pub link_password: Option<String>,
}

pub async fn insert_file(db: &SqlitePool, file: NewFile<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO files (id, object_key, orig_name, content_type, size_bytes, user_id, status, created_at, expires_at, auto_delete, link_password) \
         VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?);",
    )
    .bind(file.id)
    .bind(file.object_key)
    .bind(file.orig_name)
    .bind(file.content_type)
    .bind(file.size_bytes)
    .bind(file.user_id)
    .bind(now_ts())
    .bind(&file.expires_at)
    .bind(file.auto_delete)
    .bind(&file.link_password)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn fetch_file(db: &SqlitePool, id: &str) -> Result<Option<FileRecord>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, object_key, orig_name, content_type, size_bytes, sha256_hex, sha256_bytes, user_id, status, created_at, expires_at, auto_delete, link_password, download_count, last_downloaded_at \
         FROM files WHERE id = ? LIMIT 1;",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

pub async fn fetch_files_for_user(
    db: &SqlitePool,
    user_id: &str,
) -> Result<Vec<FileRecord>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, object_key, orig_name, content_type, size_bytes, sha256_hex, sha256_bytes, user_id, status, created_at, expires_at, auto_delete, link_password, download_count, last_downloaded_at \
         FROM files WHERE user_id = ? ORDER BY created_at DESC;",
    )
    .bind(user_id)
    .fetch_all(db)
    .await
}

/// Advance pending -> stored. The status predicate makes this a one-winner
/// operation: a second concurrent caller sees zero rows affected.
pub async fn mark_stored(db: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE files SET status = 'stored' WHERE id = ? AND status = 'pending';")
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Advance stored -> hashed, recording the integrity pass results.
pub async fn mark_hashed(
    db: &SqlitePool,
    id: &str,
    sha256_hex: &str,
    sha256_bytes: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE files SET status = 'hashed', sha256_hex = ?, sha256_bytes = ? \
         WHERE id = ? AND status = 'stored';",
    )
    .bind(sha256_hex)
    .bind(sha256_bytes)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Move a record into the failed sink from any live state.
pub async fn mark_failed(db: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE files SET status = 'failed' WHERE id = ? AND status != 'failed';")
        .bind(id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Best-effort download bookkeeping; callers log and ignore errors.
pub async fn record_download(db: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE files SET download_count = download_count + 1, last_downloaded_at = ? WHERE id = ?;",
    )
    .bind(now_ts())
    .bind(id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn delete_file_row(db: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM files WHERE id = ?;")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

/// Sum of declared sizes over the owner's records whose bytes are (or may
/// be) in the object store. This is what `/quota` reports.
///
/// Computed on demand instead of keeping a running counter, so the value can
/// never drift from the table.
pub async fn current_usage(db: &SqlitePool, user_id: &str) -> Result<i64, sqlx::Error> {
    let usage: Option<i64> = sqlx::query_scalar(
        "SELECT SUM(size_bytes) FROM files WHERE user_id = ? AND status IN ('stored', 'hashed', 'ready');",
    )
    .bind(user_id)
    .fetch_one(db)
    .await?;
    Ok(usage.unwrap_or(0))
}

/// Sum of declared sizes over all of the owner's non-failed records,
/// `pending` included. This is what the registration gate checks: a pending
/// record is a reservation, and counting it keeps a burst of registrations
/// from collectively overshooting the cap once their uploads land.
pub async fn reserved_usage(db: &SqlitePool, user_id: &str) -> Result<i64, sqlx::Error> {
    let usage: Option<i64> = sqlx::query_scalar(
        "SELECT SUM(size_bytes) FROM files WHERE user_id = ? AND status != 'failed';",
    )
    .bind(user_id)
    .fetch_one(db)
    .await?;
    Ok(usage.unwrap_or(0))
}

#[derive(Debug, FromRow)]
pub struct ReapCandidate {
    pub id: String,
    pub object_key: String,
}

/// Records eligible for cleanup: unfinished uploads past the stale cutoff,
/// and auto-delete records whose TTL has lapsed. Capped and oldest-first so a
/// single sweep stays bounded.
pub async fn reap_candidates(
    db: &SqlitePool,
    stale_cutoff: &str,
    now: &str,
    limit: i64,
) -> Result<Vec<ReapCandidate>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, object_key FROM files \
         WHERE (created_at < ? AND status IN ('pending', 'failed')) \
            OR (auto_delete = TRUE AND expires_at IS NOT NULL AND expires_at < ?) \
         ORDER BY created_at ASC LIMIT ?;",
    )
    .bind(stale_cutoff)
    .bind(now)
    .bind(limit)
    .fetch_all(db)
    .await
}

// ---- users --------------------------------------------------------------

pub struct NewUser<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub username: &'a str,
    pub password_hash: &'a str,
    pub is_admin: bool,
    pub storage_quota_bytes: Option<i64>,
}

pub async fn insert_user(db: &SqlitePool, user: NewUser<'_>) -> Result<(), sqlx::Error> {
    let ts = now_ts();
    sqlx::query(
        "INSERT INTO users (id, email, username, password_hash, email_verified, is_admin, storage_quota_bytes, created_at, updated_at) \
         VALUES (?, ?, ?, ?, FALSE, ?, ?, ?, ?);",
    )
    .bind(user.id)
    .bind(user.email)
    .bind(user.username)
    .bind(user.password_hash)
    .bind(user.is_admin)
    .bind(user.storage_quota_bytes)
    .bind(&ts)
    .bind(&ts)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn fetch_user_by_username(
    db: &SqlitePool,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, email, username, password_hash, email_verified, is_admin, storage_quota_bytes, created_at, updated_at \
         FROM users WHERE username = ? LIMIT 1;",
    )
    .bind(username)
    .fetch_optional(db)
    .await
}

pub async fn fetch_user_by_id(db: &SqlitePool, id: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, email, username, password_hash, email_verified, is_admin, storage_quota_bytes, created_at, updated_at \
         FROM users WHERE id = ? LIMIT 1;",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

/// Number of non-failed file records the user still owns. Gates user deletion.
pub async fn live_file_count(db: &SqlitePool, user_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE user_id = ? AND status != 'failed';")
        .bind(user_id)
        .fetch_one(db)
        .await
}

pub async fn delete_user_row(db: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM users WHERE id = ?;")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

// ---- resumable sessions -------------------------------------------------

pub async fn insert_session(
    db: &SqlitePool,
    id: &str,
    file_id: &str,
    object_key: &str,
    total_size: i64,
) -> Result<(), sqlx::Error> {
    let ts = now_ts();
    sqlx::query(
        "INSERT INTO resumable_uploads (id, file_id, object_key, total_size, current_offset, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 0, 'active', ?, ?);",
    )
    .bind(id)
    .bind(file_id)
    .bind(object_key)
    .bind(total_size)
    .bind(&ts)
    .bind(&ts)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn fetch_session(
    db: &SqlitePool,
    id: &str,
) -> Result<Option<ResumableSession>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, file_id, object_key, total_size, current_offset, status, created_at, updated_at \
         FROM resumable_uploads WHERE id = ? LIMIT 1;",
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

/// Advance the session offset, predicated on the expected current offset.
/// Concurrent PATCHes on the same session race here and exactly one wins.
pub async fn advance_session_offset(
    db: &SqlitePool,
    id: &str,
    expected_offset: i64,
    new_offset: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE resumable_uploads SET current_offset = ?, updated_at = ? \
         WHERE id = ? AND current_offset = ? AND status = 'active';",
    )
    .bind(new_offset)
    .bind(now_ts())
    .bind(id)
    .bind(expected_offset)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_session_status(
    db: &SqlitePool,
    id: &str,
    status: SessionStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE resumable_uploads SET status = ?, updated_at = ? WHERE id = ?;")
        .bind(status)
        .bind(now_ts())
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

/// Active sessions with no activity since the cutoff; garbage-collected by the reaper.
pub async fn stale_sessions(
    db: &SqlitePool,
    cutoff: &str,
) -> Result<Vec<ResumableSession>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, file_id, object_key, total_size, current_offset, status, created_at, updated_at \
         FROM resumable_uploads WHERE status = 'active' AND updated_at < ?;",
    )
    .bind(cutoff)
    .fetch_all(db)
    .await
}

pub async fn delete_session_row(db: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM resumable_uploads WHERE id = ?;")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

// ---- test support -------------------------------------------------------

/// Fresh in-memory database with all migrations applied.
///
/// Capped at a single connection: every pooled connection to "sqlite::memory:"
/// would otherwise open its own empty database.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// Insert a throwaway user and return its id.
#[cfg(test)]
pub async fn test_user(db: &SqlitePool, quota: Option<i64>) -> String {
    let id = new_id();
    insert_user(
        db,
        NewUser {
            id: &id,
            email: &format!("{id}@example.com"),
            username: &id,
            password_hash: "$2b$10$7EqJtq98hPqEX7fNZaFWoOhi5B0a6DQJIdrUxUcsnayUD7V1F5nxy",
            is_admin: false,
            storage_quota_bytes: quota,
        },
    )
    .await
    .unwrap();
    id
}

/// Insert a file record in the given state and return its id.
#[cfg(test)]
pub async fn test_file(db: &SqlitePool, user_id: &str, size: i64, status: FileStatus) -> String {
    let id = new_id();
    let key = crate::storage::object_key_for(&id);
    insert_file(
        db,
        NewFile {
            id: &id,
            object_key: &key,
            orig_name: "test.bin",
            content_type: "application/octet-stream",
            size_bytes: size,
            user_id,
            expires_at: None,
            auto_delete: false,
            link_password: None,
        },
    )
    .await
    .unwrap();
    // Walk the record forward through the legal transitions.
    match status {
        FileStatus::Pending => {}
        FileStatus::Stored => {
            assert!(mark_stored(db, &id).await.unwrap());
        }
        FileStatus::Hashed | FileStatus::Ready => {
            assert!(mark_stored(db, &id).await.unwrap());
            assert!(mark_hashed(db, &id, &"0".repeat(64), size).await.unwrap());
        }
        FileStatus::Failed => {
            assert!(mark_failed(db, &id).await.unwrap());
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_transitions_follow_the_dag() {
        let db = test_pool().await;
        let user = test_user(&db, None).await;
        let id = test_file(&db, &user, 5, FileStatus::Pending).await;

        // pending -> stored succeeds exactly once.
        assert!(mark_stored(&db, &id).await.unwrap());
        assert!(!mark_stored(&db, &id).await.unwrap());

        // hashed requires stored.
        assert!(mark_hashed(&db, &id, &"a".repeat(64), 5).await.unwrap());
        assert!(!mark_hashed(&db, &id, &"a".repeat(64), 5).await.unwrap());

        let file = fetch_file(&db, &id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Hashed);
        assert_eq!(file.sha256_hex.as_deref(), Some("a".repeat(64).as_str()));
        assert_eq!(file.sha256_bytes, Some(5));

        // failed is reachable from hashed, and is terminal.
        assert!(mark_failed(&db, &id).await.unwrap());
        assert!(!mark_failed(&db, &id).await.unwrap());
        assert!(!mark_stored(&db, &id).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_finalize_has_one_winner() {
        let db = test_pool().await;
        let user = test_user(&db, None).await;
        let id = test_file(&db, &user, 5, FileStatus::Pending).await;

        let (a, b) = tokio::join!(mark_stored(&db, &id), mark_stored(&db, &id));
        let wins = [a.unwrap(), b.unwrap()];
        assert_eq!(wins.iter().filter(|w| **w).count(), 1);
    }

    #[tokio::test]
    async fn usage_counts_only_states_that_hold_bytes() {
        let db = test_pool().await;
        let user = test_user(&db, None).await;
        test_file(&db, &user, 100, FileStatus::Pending).await;
        test_file(&db, &user, 200, FileStatus::Stored).await;
        test_file(&db, &user, 300, FileStatus::Hashed).await;
        test_file(&db, &user, 400, FileStatus::Failed).await;

        // The display sum covers only states whose bytes are in the store.
        assert_eq!(current_usage(&db, &user).await.unwrap(), 500);
        // The registration gate also counts pending reservations.
        assert_eq!(reserved_usage(&db, &user).await.unwrap(), 600);
    }

    #[tokio::test]
    async fn reap_candidates_selects_stale_and_expired() {
        let db = test_pool().await;
        let user = test_user(&db, None).await;

        let stale = test_file(&db, &user, 1, FileStatus::Pending).await;
        let live = test_file(&db, &user, 1, FileStatus::Hashed).await;

        // An already-expired auto-delete record.
        let expired = new_id();
        insert_file(
            &db,
            NewFile {
                id: &expired,
                object_key: &crate::storage::object_key_for(&expired),
                orig_name: "old.bin",
                content_type: "application/octet-stream",
                size_bytes: 1,
                user_id: &user,
                expires_at: Some("2000-01-01T00:00:00+00:00".into()),
                auto_delete: true,
                link_password: None,
            },
        )
        .await
        .unwrap();

        // Cutoff in the future makes every pending/failed record stale.
        let future = "2999-01-01T00:00:00+00:00";
        let candidates = reap_candidates(&db, future, &now_ts(), 100).await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert!(ids.contains(&stale.as_str()));
        assert!(ids.contains(&expired.as_str()));
        assert!(!ids.contains(&live.as_str()));

        // With a cutoff in the past only the TTL-expired record qualifies.
        let past = "2000-01-01T00:00:00+00:00";
        let candidates = reap_candidates(&db, past, &now_ts(), 100).await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![expired.as_str()]);
    }

    #[tokio::test]
    async fn session_offset_advance_is_predicated() {
        let db = test_pool().await;
        let user = test_user(&db, None).await;
        let file_id = test_file(&db, &user, 10, FileStatus::Pending).await;
        let sid = new_id();
        insert_session(&db, &sid, &file_id, &crate::storage::object_key_for(&file_id), 10)
            .await
            .unwrap();

        assert!(advance_session_offset(&db, &sid, 0, 4).await.unwrap());
        // A retry of the already-applied chunk misses the predicate.
        assert!(!advance_session_offset(&db, &sid, 0, 4).await.unwrap());
        assert!(advance_session_offset(&db, &sid, 4, 10).await.unwrap());

        set_session_status(&db, &sid, SessionStatus::Completed)
            .await
            .unwrap();
        // Completed sessions accept no further writes.
        assert!(!advance_session_offset(&db, &sid, 10, 12).await.unwrap());
    }

    #[tokio::test]
    async fn user_deletion_is_gated_on_live_files() {
        let db = test_pool().await;
        let user = test_user(&db, None).await;
        test_file(&db, &user, 1, FileStatus::Failed).await;
        assert_eq!(live_file_count(&db, &user).await.unwrap(), 0);

        test_file(&db, &user, 1, FileStatus::Hashed).await;
        assert_eq!(live_file_count(&db, &user).await.unwrap(), 1);
    }

    #[test]
    fn expiry_parsing() {
        assert!(has_expired("2000-01-01T00:00:00+00:00").unwrap());
        assert!(!has_expired("2999-01-01T00:00:00+00:00").unwrap());
        assert!(has_expired("garbage").is_err());
    }
}
