//! Upload pipeline: metadata registration and streamed multipart ingestion

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::{Multipart, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{prelude::Utc, SubsecRound, TimeDelta};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::*;

/// Ceiling for a single streamed put against the object store. Generous so
/// large files over slow links still make it.
pub const STORE_PUT_TIMEOUT: Duration = Duration::from_secs(300);

/// Set of file ids with an ingest stream currently running in this process.
///
/// The database predicate already guarantees a single winner per lifecycle
/// transition; this set additionally stops a second stream from overwriting
/// the winner's object bytes while both are in flight.
pub type ActiveUploads = Arc<Mutex<HashSet<String>>>;

/// RAII claim on a file id in [ActiveUploads].
pub struct UploadClaim {
    id: String,
    set: ActiveUploads,
}

impl UploadClaim {
    pub fn acquire(set: &ActiveUploads, id: &str) -> Option<Self> {
        if set.lock().unwrap().insert(id.to_string()) {
            Some(Self {
                id: id.to_string(),
                set: set.clone(),
            })
        } else {
            None
        }
    }
}

impl Drop for UploadClaim {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

/// Scoped temp file in the spool directory; removed on all exit paths.
struct SpoolGuard {
    path: PathBuf,
}

impl Drop for SpoolGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    orig_name: String,
    content_type: String,
    size_bytes: i64,
    ttl_hours: Option<i64>,
    link_password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub id: String,
    pub object_key: String,
    pub status: &'static str,
}

/// POST /files - register a new file record in state `pending`.
///
/// No bytes move here; the caller follows up with POST /upload (or a
/// resumable session) referencing the returned id.
pub async fn register_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let orig_name = req.orig_name.trim().to_string();
    let content_type = req.content_type.trim().to_string();

    if orig_name.is_empty() {
        return AppError::err(StatusCode::BAD_REQUEST, "orig_name must not be empty");
    }
    if content_type.is_empty() {
        return AppError::err(StatusCode::BAD_REQUEST, "content_type must not be empty");
    }
    if req.size_bytes < 0 {
        return AppError::err(StatusCode::BAD_REQUEST, "size_bytes must not be negative");
    }
    if matches!(req.ttl_hours, Some(h) if h < 0) {
        return AppError::err(StatusCode::BAD_REQUEST, "ttl_hours must not be negative");
    }

    // File records are owned by database users; the bootstrap admin exists
    // only in the configuration and cannot own rows.
    let user = db::fetch_user_by_id(&aps.db, &auth.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::forbidden("only registered users can own files"))?;

    quota::enforce_quota(&aps, &user, req.size_bytes).await?;

    let id = db::new_id();
    let object_key = storage::object_key_for(&id);

    let (expires_at, auto_delete) = match req.ttl_hours {
        Some(hours) if hours > 0 => {
            let expiry = Utc::now()
                .round_subsecs(0)
                .checked_add_signed(TimeDelta::hours(hours))
                .ok_or_else(|| AppError::invalid_argument("ttl_hours is out of range"))?;
            (Some(expiry.to_rfc3339()), true)
        }
        _ => (None, false),
    };

    let link_password = match req.link_password {
        Some(pw) if !pw.is_empty() => Some(
            bcrypt::hash(&pw, bcrypt::DEFAULT_COST)
                .map_err(|e| AppError::server_error(format!("failed to hash password: {e}")))?,
        ),
        _ => None,
    };

    db::insert_file(
        &aps.db,
        db::NewFile {
            id: &id,
            object_key: &object_key,
            orig_name: &orig_name,
            content_type: &content_type,
            size_bytes: req.size_bytes,
            user_id: &user.id,
            expires_at,
            auto_delete,
            link_password,
        },
    )
    .await
    .map_err(|e| AppError::server_error(format!("database error: {e}")))?;

    tracing::info!(
        file_id = id,
        size_bytes = req.size_bytes,
        "registered new file"
    );

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id,
            object_key,
            status: "pending",
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    id: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub id: String,
    pub object_key: String,
    pub status: &'static str,
}

/// POST /upload?id=<id> - stream the multipart part named `file` into the
/// object store and run the integrity pass.
///
/// The body is spooled to a scoped temp file chunk by chunk (never buffered
/// in memory), capped at the configured ceiling, then handed to the store.
/// The hash runs before the response, so success reports `status:"hashed"`.
pub async fn upload_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let file = db::fetch_file(&aps.db, &params.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such file"))?;

    if file.user_id != auth.id {
        return AppError::err(StatusCode::FORBIDDEN, "not the owner of this file");
    }
    if file.status != db::FileStatus::Pending {
        return AppError::err(StatusCode::CONFLICT, "file is not awaiting upload");
    }

    // One ingest stream per id at a time; a concurrent attempt conflicts
    // immediately instead of overwriting bytes mid-flight.
    let _claim = UploadClaim::acquire(&aps.active_uploads, &file.id)
        .ok_or_else(|| AppError::conflict("an upload for this file is already in progress"))?;

    // Spool the part named 'file' to disk; any other parts are drained and
    // ignored. The field borrow never outlives its loop iteration.
    let spool = SpoolGuard {
        path: PathBuf::from(&aps.conf.spool_dir).join(format!("upload-{}", file.id)),
    };
    let mut received: Option<u64> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return AppError::err(
                    StatusCode::BAD_REQUEST,
                    format!("malformed multipart stream: {e}"),
                );
            }
        };
        if field.name() != Some("file") || received.is_some() {
            continue;
        }
        received = Some(spool_field(&aps, &file.id, field, &spool.path).await?);
    }
    let received = received
        .ok_or_else(|| AppError::invalid_argument("multipart part 'file' is missing"))?;

    // Hand the spooled bytes to the object store under the derived key.
    let put = tokio::time::timeout(
        STORE_PUT_TIMEOUT,
        aps.store.put_path(&file.object_key, &spool.path),
    )
    .await;
    match put {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(file_id = file.id, "object store put failed: {e}");
            fail_record(&aps, &file.id).await;
            return Err(AppError::bad_gateway("object store unavailable"));
        }
        Err(_) => {
            tracing::error!(file_id = file.id, "object store put timed out");
            fail_record(&aps, &file.id).await;
            return Err(AppError::bad_gateway("object store timed out"));
        }
    }

    // Single winner: only one handler may move the record out of 'pending'.
    let stored = db::mark_stored(&aps.db, &file.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;
    if !stored {
        return AppError::err(StatusCode::CONFLICT, "file was finalized concurrently");
    }

    tracing::info!(file_id = file.id, bytes = received, "upload stored");

    finalize_hash(&aps, &file.id, &file.object_key).await?;

    Ok(Json(UploadResponse {
        id: file.id,
        object_key: file.object_key,
        status: "hashed",
    }))
}

/// Stream one multipart field into the spool file, counting bytes against
/// the configured ceiling. Returns the number of bytes written.
async fn spool_field(
    aps: &AppState,
    file_id: &str,
    mut field: axum::extract::multipart::Field<'_>,
    path: &std::path::Path,
) -> Result<u64, AppError> {
    let mut out = tokio::fs::File::create(path)
        .await
        .map_err(|e| AppError::server_error(format!("failed to create spool file: {e}")))?;

    let max_bytes = aps.conf.max_upload_bytes;
    let mut received: u64 = 0;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                fail_record(aps, file_id).await;
                return AppError::err(
                    StatusCode::BAD_REQUEST,
                    format!("upload stream aborted: {e}"),
                );
            }
        };
        received += chunk.len() as u64;
        if received > max_bytes {
            fail_record(aps, file_id).await;
            return Err(AppError::payload_too_large(
                "upload exceeds the configured size limit",
            ));
        }
        out.write_all(&chunk)
            .await
            .map_err(|e| AppError::server_error(format!("failed to write spool file: {e}")))?;
    }
    out.flush()
        .await
        .map_err(|e| AppError::server_error(format!("failed to flush spool file: {e}")))?;

    Ok(received)
}

/// Run the integrity pass against the stored object and advance the record.
/// Shared by the multipart pipeline and resumable-session completion.
pub async fn finalize_hash(
    aps: &AppState,
    file_id: &str,
    object_key: &str,
) -> Result<(), AppError> {
    match hasher::hash_object(aps.store.as_ref(), object_key).await {
        Ok(outcome) => {
            db::mark_hashed(&aps.db, file_id, &outcome.sha256_hex, outcome.byte_count)
                .await
                .map_err(|e| AppError::server_error(format!("database error: {e}")))?;
            tracing::info!(
                file_id,
                sha256 = outcome.sha256_hex,
                bytes = outcome.byte_count,
                "integrity pass complete"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(file_id, "integrity pass failed: {e}");
            fail_record(aps, file_id).await;
            Err(AppError::bad_gateway("integrity pass failed"))
        }
    }
}

/// Push a record into the failed sink, logging rather than propagating any
/// database problem; the original error is what the caller reports.
async fn fail_record(aps: &AppState, file_id: &str) {
    if let Err(e) = db::mark_failed(&aps.db, file_id).await {
        tracing::error!(file_id, "failed to mark record as failed: {e}");
    }
}

#[derive(Debug, Serialize)]
pub struct FileListEntry {
    id: String,
    orig_name: String,
    content_type: String,
    size_bytes: i64,
    sha256_hex: Option<String>,
    status: String,
    created_at: String,
    expires_at: Option<String>,
    download_count: i64,
    last_downloaded_at: Option<String>,
}

/// GET /files - the caller's records, newest first.
pub async fn list_files_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
) -> Result<Json<Vec<FileListEntry>>, AppError> {
    let files = db::fetch_files_for_user(&aps.db, &auth.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;

    Ok(Json(
        files
            .into_iter()
            .map(|f| FileListEntry {
                id: f.id,
                orig_name: f.orig_name,
                content_type: f.content_type,
                size_bytes: f.size_bytes,
                sha256_hex: f.sha256_hex,
                status: f.status.as_str().to_string(),
                created_at: f.created_at,
                expires_at: f.expires_at,
                download_count: f.download_count,
                last_downloaded_at: f.last_downloaded_at,
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_claim_is_exclusive_and_released_on_drop() {
        let set: ActiveUploads = Arc::new(Mutex::new(HashSet::new()));

        let first = UploadClaim::acquire(&set, "file-1").unwrap();
        assert!(UploadClaim::acquire(&set, "file-1").is_none());
        // A different id is unaffected.
        assert!(UploadClaim::acquire(&set, "file-2").is_some());

        drop(first);
        assert!(UploadClaim::acquire(&set, "file-1").is_some());
    }
}
