//! Privileged endpoints: synchronous cleanup, overview and user management

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Serialize;
use sqlx::FromRow;

use crate::*;

/// POST /admin/cleanup - run one cleanup sweep right now and report it.
pub async fn cleanup_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
) -> Result<Json<reaper::SweepStats>, AppError> {
    session::require_admin(&aps, &auth).await?;

    let stats = reaper::run_sweep(&aps)
        .await
        .map_err(|e| AppError::server_error(format!("cleanup sweep failed: {e}")))?;
    Ok(Json(stats))
}

#[derive(Debug, Serialize, FromRow)]
pub struct AdminFileEntry {
    id: String,
    orig_name: String,
    size_bytes: i64,
    user_id: String,
    status: String,
    created_at: String,
    expires_at: Option<String>,
    download_count: i64,
}

/// GET /admin/files - every live record on the instance.
pub async fn overview_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
) -> Result<Json<Vec<AdminFileEntry>>, AppError> {
    session::require_admin(&aps, &auth).await?;

    let files: Vec<AdminFileEntry> = sqlx::query_as(
        "SELECT id, orig_name, size_bytes, user_id, status, created_at, expires_at, download_count \
         FROM files WHERE status != 'failed' ORDER BY created_at DESC;",
    )
    .fetch_all(&aps.db)
    .await
    .map_err(|e| AppError::server_error(format!("database error: {e}")))?;

    Ok(Json(files))
}

/// DELETE /admin/users/{id} - remove an account.
///
/// Refused while the user still owns any non-failed file records; delete or
/// expire those first. This keeps object bytes from ever being orphaned by
/// an account removal.
pub async fn delete_user_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    session::require_admin(&aps, &auth).await?;

    let user = db::fetch_user_by_id(&aps.db, &user_id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such user"))?;

    let live = db::live_file_count(&aps.db, &user.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;
    if live > 0 {
        return AppError::err(
            StatusCode::CONFLICT,
            "user still owns files, delete those first",
        );
    }

    db::delete_user_row(&aps.db, &user.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;

    tracing::info!(user_id = user.id, username = user.username, "deleted user");
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileStatus;

    #[tokio::test]
    async fn user_with_live_files_cannot_be_deleted() {
        let db = db::test_pool().await;
        let user = db::test_user(&db, None).await;
        db::test_file(&db, &user, 5, FileStatus::Hashed).await;

        // The gate the endpoint enforces.
        assert!(db::live_file_count(&db, &user).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn user_with_only_failed_files_can_be_deleted() {
        let db = db::test_pool().await;
        let user = db::test_user(&db, None).await;
        db::test_file(&db, &user, 5, FileStatus::Failed).await;

        assert_eq!(db::live_file_count(&db, &user).await.unwrap(), 0);
        db::delete_user_row(&db, &user).await.unwrap();
        assert!(db::fetch_user_by_id(&db, &user).await.unwrap().is_none());
    }
}
