//! Endpoint and utilities for manual and automatic file deletion

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension,
};
use sqlx::SqlitePool;

use crate::storage::ObjectStore;
use crate::*;

/// DELETE /files/{id} - remove a file before it expires.
///
/// Allowed for the record's owner and for administrators.
pub async fn delete_file_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let file = db::fetch_file(&aps.db, &id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such file"))?;

    if file.user_id != auth.id {
        // Not the owner; administrators may still proceed.
        session::require_admin(&aps, &auth)
            .await
            .map_err(|_| AppError::forbidden("not the owner of this file"))?;
    }

    cleanup_file(&file.id, &file.object_key, &aps.db, aps.store.as_ref()).await?;
    tracing::info!(file_id = file.id, "manually deleted file");
    Ok(StatusCode::OK)
}

/// Remove a single file: best-effort object delete first, then the row.
///
/// Shared by the manual endpoint and the cleanup task. A missing object is
/// fine (pending records never had bytes); a failing store still lets the
/// row deletion report its own result.
pub async fn cleanup_file(
    id: &str,
    object_key: &str,
    db: &SqlitePool,
    store: &dyn ObjectStore,
) -> Result<(), anyhow::Error> {
    if let Err(e) = store.delete(object_key).await {
        tracing::warn!(file_id = id, "failed to delete object from store: {e}");
    }

    db::delete_file_row(db, id).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileStatus;
    use crate::storage::MemoryObjectStore;

    #[tokio::test]
    async fn cleanup_removes_row_and_object() {
        let db = db::test_pool().await;
        let store = MemoryObjectStore::new();
        let user = db::test_user(&db, None).await;
        let id = db::test_file(&db, &user, 5, FileStatus::Hashed).await;
        let key = storage::object_key_for(&id);
        store.insert(&key, b"hello");

        cleanup_file(&id, &key, &db, &store).await.unwrap();

        assert!(db::fetch_file(&db, &id).await.unwrap().is_none());
        assert!(!store.contains(&key));
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_object() {
        let db = db::test_pool().await;
        let store = MemoryObjectStore::new();
        let user = db::test_user(&db, None).await;
        // Pending records never had bytes in the store.
        let id = db::test_file(&db, &user, 5, FileStatus::Pending).await;

        cleanup_file(&id, &storage::object_key_for(&id), &db, &store)
            .await
            .unwrap();
        assert!(db::fetch_file(&db, &id).await.unwrap().is_none());
    }
}
