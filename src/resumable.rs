//! TUS-style resumable upload sessions layered on the upload pipeline
//!
//! Implements the core + creation semantics of TUS 1.0.0: a session is
//! created against a pending file record, chunks are appended strictly in
//! order at the current offset, and the final chunk pushes the staged bytes
//! through the same store-then-hash finalization as a plain upload.

use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    extract::{Path as UrlPath, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
    Extension,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::*;

pub const TUS_VERSION: &str = "1.0.0";

/// Location of a session's staging file under the spool directory.
pub fn staging_path(spool_dir: &str, session_id: &str) -> PathBuf {
    Path::new(spool_dir).join(format!("resumable-{session_id}"))
}

/// Pull the decoded `file_id` entry out of a TUS Upload-Metadata header,
/// which is a comma-separated list of "key base64(value)" pairs.
fn parse_file_id_metadata(header: &str) -> Option<String> {
    for pair in header.split(',') {
        let mut parts = pair.trim().splitn(2, ' ');
        if parts.next() == Some("file_id") {
            let encoded = parts.next()?;
            let decoded = STANDARD.decode(encoded).ok()?;
            return String::from_utf8(decoded).ok();
        }
    }
    None
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

/// POST /upload/resumable - open a session against a pending file record.
pub async fn create_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let total_size = header_i64(&headers, "Upload-Length")
        .ok_or_else(|| AppError::invalid_argument("Upload-Length header is required"))?;
    if total_size < 0 {
        return AppError::err(StatusCode::BAD_REQUEST, "Upload-Length must not be negative");
    }

    let metadata = headers
        .get("Upload-Metadata")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::invalid_argument("Upload-Metadata header is required"))?;
    let file_id = parse_file_id_metadata(metadata)
        .ok_or_else(|| AppError::invalid_argument("Upload-Metadata must carry a file_id entry"))?;

    let file = db::fetch_file(&aps.db, &file_id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such file"))?;

    if file.user_id != auth.id {
        return AppError::err(StatusCode::FORBIDDEN, "not the owner of this file");
    }
    if file.status != db::FileStatus::Pending {
        return AppError::err(StatusCode::CONFLICT, "file is not awaiting upload");
    }

    let session_id = db::new_id();
    db::insert_session(&aps.db, &session_id, &file.id, &file.object_key, total_size)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;

    // The staging file exists for the whole session lifetime; each PATCH
    // appends to it and completion streams it into the object store.
    tokio::fs::File::create(staging_path(&aps.conf.spool_dir, &session_id))
        .await
        .map_err(|e| AppError::server_error(format!("failed to create staging file: {e}")))?;

    tracing::info!(session_id, file_id = file.id, total_size, "resumable session created");

    let response = Response::builder()
        .status(StatusCode::CREATED)
        .header("Tus-Resumable", TUS_VERSION)
        .header(header::LOCATION, format!("/upload/resumable/{session_id}"))
        .header("Upload-Offset", "0")
        .body(Body::empty())
        .map_err(|e| AppError::server_error(format!("failed to build response: {e}")))?;
    Ok(response)
}

/// PATCH /upload/resumable/{id} - append one chunk at the current offset.
///
/// The offset claim happens through a predicated database update before any
/// byte is written, so concurrent PATCHes on one session have exactly one
/// winner and the staging file only ever sees a single writer.
pub async fn patch_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
    UrlPath(session_id): UrlPath<String>,
    req: Request,
) -> Result<Response, AppError> {
    let session = db::fetch_session(&aps.db, &session_id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such upload session"))?;

    if session.status != db::SessionStatus::Active {
        return AppError::err(StatusCode::CONFLICT, "upload session is not active");
    }

    let file = db::fetch_file(&aps.db, &session.file_id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such file"))?;
    if file.user_id != auth.id {
        return AppError::err(StatusCode::FORBIDDEN, "not the owner of this file");
    }

    let offset = header_i64(req.headers(), "Upload-Offset")
        .ok_or_else(|| AppError::invalid_argument("Upload-Offset header is required"))?;
    if offset != session.current_offset {
        return AppError::err(StatusCode::CONFLICT, "Upload-Offset does not match session");
    }

    let chunk_len = header_i64(req.headers(), "Content-Length")
        .ok_or_else(|| AppError::invalid_argument("Content-Length header is required"))?;
    if chunk_len <= 0 {
        return AppError::err(StatusCode::BAD_REQUEST, "chunk must not be empty");
    }
    let new_offset = offset + chunk_len;
    if new_offset > session.total_size {
        return AppError::err(
            StatusCode::BAD_REQUEST,
            "chunk would exceed the declared upload length",
        );
    }

    let staging = staging_path(&aps.conf.spool_dir, &session.id);

    // A staging file out of step with the recorded offset means an earlier
    // chunk died halfway; the session cannot be trusted any longer.
    let staged_len = tokio::fs::metadata(&staging)
        .await
        .map(|m| m.len() as i64)
        .unwrap_or(-1);
    if staged_len != session.current_offset {
        let _ = db::set_session_status(&aps.db, &session.id, db::SessionStatus::Failed).await;
        return AppError::err(StatusCode::CONFLICT, "upload session is corrupt, start over");
    }

    // Claim the window [offset, new_offset); a racing PATCH misses the
    // predicate and conflicts without having touched the staging file.
    let claimed = db::advance_session_offset(&aps.db, &session.id, offset, new_offset)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;
    if !claimed {
        return AppError::err(StatusCode::CONFLICT, "a chunk for this offset is already in flight");
    }

    // Append the body, counting bytes against the declared chunk length.
    let mut out = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&staging)
        .await
        .map_err(|e| AppError::server_error(format!("failed to open staging file: {e}")))?;

    let mut written: i64 = 0;
    let mut stream = req.into_body().into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ =
                    db::set_session_status(&aps.db, &session.id, db::SessionStatus::Failed).await;
                return AppError::err(StatusCode::BAD_REQUEST, format!("chunk stream aborted: {e}"));
            }
        };
        written += chunk.len() as i64;
        if written > chunk_len {
            let _ = db::set_session_status(&aps.db, &session.id, db::SessionStatus::Failed).await;
            return AppError::err(StatusCode::BAD_REQUEST, "body exceeds Content-Length");
        }
        out.write_all(&chunk)
            .await
            .map_err(|e| AppError::server_error(format!("failed to write staging file: {e}")))?;
    }
    out.flush()
        .await
        .map_err(|e| AppError::server_error(format!("failed to flush staging file: {e}")))?;
    drop(out);

    if written != chunk_len {
        let _ = db::set_session_status(&aps.db, &session.id, db::SessionStatus::Failed).await;
        return AppError::err(StatusCode::BAD_REQUEST, "body shorter than Content-Length");
    }

    tracing::info!(
        session_id = session.id,
        offset = new_offset,
        total = session.total_size,
        "resumable chunk accepted"
    );

    if new_offset == session.total_size {
        complete_session(&aps, &session.id, &file.id, &file.object_key, &staging).await?;
    }

    let response = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Offset", new_offset.to_string())
        .body(Body::empty())
        .map_err(|e| AppError::server_error(format!("failed to build response: {e}")))?;
    Ok(response)
}

/// Push a fully-staged session into the object store and finalize the file.
pub async fn complete_session(
    aps: &AppState,
    session_id: &str,
    file_id: &str,
    object_key: &str,
    staging: &Path,
) -> Result<(), AppError> {
    // Same single-stream guard as the multipart pipeline; a plain upload
    // racing a completing session must not overwrite the winner's bytes.
    let _claim = upload::UploadClaim::acquire(&aps.active_uploads, file_id)
        .ok_or_else(|| AppError::conflict("an upload for this file is already in progress"))?;

    let put = tokio::time::timeout(
        upload::STORE_PUT_TIMEOUT,
        aps.store.put_path(object_key, staging),
    )
    .await;
    match put {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(file_id, "object store put failed: {e}");
            let _ = db::set_session_status(&aps.db, session_id, db::SessionStatus::Failed).await;
            let _ = db::mark_failed(&aps.db, file_id).await;
            return Err(AppError::bad_gateway("object store unavailable"));
        }
        Err(_) => {
            tracing::error!(file_id, "object store put timed out");
            let _ = db::set_session_status(&aps.db, session_id, db::SessionStatus::Failed).await;
            let _ = db::mark_failed(&aps.db, file_id).await;
            return Err(AppError::bad_gateway("object store timed out"));
        }
    }

    let stored = db::mark_stored(&aps.db, file_id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;
    if !stored {
        let _ = db::set_session_status(&aps.db, session_id, db::SessionStatus::Failed).await;
        return AppError::err(StatusCode::CONFLICT, "file was finalized concurrently");
    }

    upload::finalize_hash(aps, file_id, object_key).await?;

    db::set_session_status(&aps.db, session_id, db::SessionStatus::Completed)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?;

    if let Err(e) = tokio::fs::remove_file(staging).await {
        tracing::warn!(session_id, "failed to remove staging file: {e}");
    }

    tracing::info!(session_id, file_id, "resumable session completed");
    Ok(())
}

/// HEAD /upload/resumable/{id} - resume discovery.
pub async fn head_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
    UrlPath(session_id): UrlPath<String>,
) -> Result<Response, AppError> {
    let session = db::fetch_session(&aps.db, &session_id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such upload session"))?;

    let file = db::fetch_file(&aps.db, &session.file_id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such file"))?;
    if file.user_id != auth.id {
        return AppError::err(StatusCode::FORBIDDEN, "not the owner of this file");
    }

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("Tus-Resumable", TUS_VERSION)
        .header("Upload-Offset", session.current_offset.to_string())
        .header("Upload-Length", session.total_size.to_string())
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))
        .body(Body::empty())
        .map_err(|e| AppError::server_error(format!("failed to build response: {e}")))?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileStatus;
    use crate::storage::MemoryObjectStore;
    use std::sync::Arc;

    #[test]
    fn upload_metadata_parsing() {
        let encoded = STANDARD.encode("file-abc");
        assert_eq!(
            parse_file_id_metadata(&format!("file_id {encoded}")),
            Some("file-abc".to_string())
        );
        // Extra entries are tolerated, order does not matter.
        assert_eq!(
            parse_file_id_metadata(&format!("filename dGVzdA==, file_id {encoded}")),
            Some("file-abc".to_string())
        );
        assert_eq!(parse_file_id_metadata("filename dGVzdA=="), None);
        assert_eq!(parse_file_id_metadata("file_id not-base64!!"), None);
    }

    #[test]
    fn staging_paths_are_scoped_to_the_session() {
        let a = staging_path("/tmp/spool", "s1");
        let b = staging_path("/tmp/spool", "s2");
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/spool"));
    }

    #[tokio::test]
    async fn completion_stores_hashes_and_cleans_up() {
        let spool = tempfile::tempdir().unwrap();
        let db = db::test_pool().await;
        let store = Arc::new(MemoryObjectStore::new());
        let mut conf = crate::test_config();
        conf.spool_dir = spool.path().to_string_lossy().into_owned();
        let aps = AppState {
            db: db.clone(),
            store: store.clone(),
            conf: Arc::new(conf),
            lockout: Arc::new(lockout::LockoutLedger::new(5, 600, 900)),
            active_uploads: Default::default(),
        };

        let user = db::test_user(&db, None).await;
        let file_id = db::test_file(&db, &user, 5, FileStatus::Pending).await;
        let object_key = storage::object_key_for(&file_id);

        let session_id = db::new_id();
        db::insert_session(&db, &session_id, &file_id, &object_key, 5)
            .await
            .unwrap();

        let staging = staging_path(&aps.conf.spool_dir, &session_id);
        tokio::fs::write(&staging, b"hello").await.unwrap();

        complete_session(&aps, &session_id, &file_id, &object_key, &staging)
            .await
            .unwrap();

        let file = db::fetch_file(&db, &file_id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Hashed);
        assert_eq!(
            file.sha256_hex.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert_eq!(file.sha256_bytes, Some(5));

        assert!(store.contains(&object_key));
        let session = db::fetch_session(&db, &session_id).await.unwrap().unwrap();
        assert_eq!(session.status, db::SessionStatus::Completed);
        assert!(!staging.exists());
    }
}
