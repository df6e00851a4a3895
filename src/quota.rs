//! Per-owner storage accounting, enforced at registration time

use axum::{extract::State, Extension, Json};
use serde::Serialize;

use crate::*;

/// Reject a registration that would push the owner past their quota.
///
/// The gate counts every non-failed record, `pending` included: each
/// registration reserves its declared size up front, so two back-to-back
/// registrations cannot together exceed the cap just because neither has
/// uploaded yet. Usage is recomputed from the table on every call. A null
/// quota means unlimited.
pub async fn enforce_quota(
    aps: &AppState,
    user: &db::User,
    additional_bytes: i64,
) -> Result<(), AppError> {
    let Some(quota) = user.storage_quota_bytes else {
        return Ok(());
    };
    let usage = db::reserved_usage(&aps.db, &user.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;
    if usage + additional_bytes > quota {
        tracing::info!(
            user_id = user.id,
            usage,
            additional_bytes,
            quota,
            "registration rejected, quota exceeded"
        );
        return Err(AppError::forbidden("storage quota exceeded"));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct QuotaResponse {
    storage_used_bytes: i64,
    /// None renders as JSON null, which clients read as "unlimited".
    storage_quota_bytes: Option<i64>,
}

/// GET /quota - the caller's current usage and cap.
///
/// Reports bytes actually held in the store (stored/hashed/ready), not the
/// stricter reservation sum the registration gate uses.
pub async fn quota_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
) -> Result<Json<QuotaResponse>, AppError> {
    // The bootstrap admin owns no rows and has no quota.
    if auth.is_bootstrap_admin() {
        return Ok(Json(QuotaResponse {
            storage_used_bytes: 0,
            storage_quota_bytes: None,
        }));
    }

    let user = db::fetch_user_by_id(&aps.db, &auth.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::unauthenticated("unknown user"))?;
    let usage = db::current_usage(&aps.db, &user.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;

    Ok(Json(QuotaResponse {
        storage_used_bytes: usage,
        storage_quota_bytes: user.storage_quota_bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileStatus;
    use crate::storage::MemoryObjectStore;
    use std::sync::Arc;

    async fn test_state() -> AppState {
        AppState {
            db: db::test_pool().await,
            store: Arc::new(MemoryObjectStore::new()),
            conf: Arc::new(crate::test_config()),
            lockout: Arc::new(lockout::LockoutLedger::new(5, 600, 900)),
            active_uploads: Default::default(),
        }
    }

    #[tokio::test]
    async fn second_registration_over_the_cap_is_refused_while_both_pending() {
        let aps = test_state().await;
        let user_id = db::test_user(&aps.db, Some(1024)).await;
        let user = db::fetch_user_by_id(&aps.db, &user_id)
            .await
            .unwrap()
            .unwrap();

        // First 600 fits the empty account.
        enforce_quota(&aps, &user, 600).await.unwrap();
        db::test_file(&aps.db, &user_id, 600, FileStatus::Pending).await;

        // The pending record reserves its bytes, so another 600 must be
        // refused even though nothing has been uploaded yet.
        let refused = enforce_quota(&aps, &user, 600).await;
        assert!(refused.is_err());

        // A smaller registration that still fits is fine.
        enforce_quota(&aps, &user, 400).await.unwrap();
    }

    #[tokio::test]
    async fn failed_records_free_their_reservation() {
        let aps = test_state().await;
        let user_id = db::test_user(&aps.db, Some(1024)).await;
        let user = db::fetch_user_by_id(&aps.db, &user_id)
            .await
            .unwrap()
            .unwrap();

        db::test_file(&aps.db, &user_id, 600, FileStatus::Hashed).await;
        db::test_file(&aps.db, &user_id, 600, FileStatus::Failed).await;

        // 600 hashed + 600 failed: only the hashed record counts.
        enforce_quota(&aps, &user, 400).await.unwrap();
        assert!(enforce_quota(&aps, &user, 600).await.is_err());
        assert_eq!(db::current_usage(&aps.db, &user_id).await.unwrap(), 600);
    }
}
