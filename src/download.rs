//! Signed-link issuance and token-redeeming download handler

use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    Extension, Json,
};
use chrono::prelude::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::*;

/// Ceiling for acquiring the object stream from the store. The stream itself
/// may run far longer; large downloads are bounded by the client, not us.
pub const STORE_GET_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    id: String,
    ttl_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct CreateLinkResponse {
    url: String,
    expires_at: String,
}

/// POST /links - mint a signed download link for a finished file.
pub async fn create_link_endpoint(
    State(aps): State<AppState>,
    Extension(auth): Extension<session::AuthUser>,
    Json(req): Json<CreateLinkRequest>,
) -> Result<Json<CreateLinkResponse>, AppError> {
    let file = db::fetch_file(&aps.db, &req.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such file"))?;

    if file.user_id != auth.id && !auth.is_bootstrap_admin() {
        return AppError::err(StatusCode::FORBIDDEN, "not the owner of this file");
    }
    if !file.status.is_downloadable() {
        return AppError::err(StatusCode::CONFLICT, "file is not ready for download");
    }

    let (token, exp) = token::mint(
        aps.conf.download_secret.as_bytes(),
        &file.id,
        req.ttl_seconds,
        Utc::now().timestamp(),
    )?;

    let expires_at = chrono::DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| AppError::server_error("link expiry out of range"))?
        .to_rfc3339();

    // Tokens are capabilities; do not log them.
    tracing::info!(file_id = file.id, expires_at, "minted download link");

    Ok(Json(CreateLinkResponse {
        url: format!("{}/download?token={token}", aps.conf.public_base_url),
        expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    token: String,
    password: Option<String>,
}

/// Escape a filename for use inside a quoted Content-Disposition parameter.
fn escape_disposition_filename(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}

/// GET /download?token=<t>[&password=<p>]
///
/// The token is the entire authority; no session cookie is consulted. Checks
/// run in order: signature/expiry of the token, record existence, lifecycle
/// state, record TTL, then the optional per-link password gate.
pub async fn download_endpoint(
    State(aps): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Result<(HeaderMap, Body), AppError> {
    let claims = token::verify(
        aps.conf.download_secret.as_bytes(),
        &params.token,
        Utc::now().timestamp(),
    )
    .map_err(|e| match e {
        token::TokenError::Expired => AppError::gone("download link expired"),
        token::TokenError::BadSignature => AppError::unauthenticated("bad token signature"),
        token::TokenError::Malformed => AppError::unauthenticated("malformed token"),
    })?;

    let file = db::fetch_file(&aps.db, &claims.file_id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::not_found("no such file"))?;

    if !file.status.is_downloadable() {
        return AppError::err(StatusCode::CONFLICT, "file is not ready for download");
    }

    // The record's own TTL binds independently of the token's.
    if let Some(expires_at) = &file.expires_at {
        if db::has_expired(expires_at).unwrap_or(true) {
            return AppError::err(StatusCode::GONE, "file has expired");
        }
    }

    // Optional second factor bound to the link itself.
    if let Some(hash) = &file.link_password {
        let presented = params
            .password
            .as_deref()
            .ok_or_else(|| AppError::unauthenticated("password required"))?;
        if !bcrypt::verify(presented, hash).unwrap_or(false) {
            return AppError::err(StatusCode::UNAUTHORIZED, "wrong password");
        }
    }

    let reader = match tokio::time::timeout(STORE_GET_TIMEOUT, aps.store.get(&file.object_key))
        .await
    {
        Ok(Ok(reader)) => reader,
        Ok(Err(e)) => {
            tracing::error!(file_id = file.id, "object store get failed: {e}");
            return Err(AppError::bad_gateway("object store unavailable"));
        }
        Err(_) => {
            tracing::error!(file_id = file.id, "object store get timed out");
            return Err(AppError::bad_gateway("object store timed out"));
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&file.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if file.size_bytes > 0 {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.size_bytes));
    }
    let disposition = format!(
        "attachment; filename=\"{}\"",
        escape_disposition_filename(&file.orig_name)
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );

    // Best-effort bookkeeping; a failure here must not break the stream.
    if let Err(e) = db::record_download(&aps.db, &file.id).await {
        tracing::warn!(file_id = file.id, "failed to record download: {e}");
    }

    tracing::info!(file_id = file.id, "streaming download");

    Ok((headers, Body::from_stream(ReaderStream::new(reader))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_quote_escaped() {
        assert_eq!(escape_disposition_filename("a.txt"), "a.txt");
        assert_eq!(
            escape_disposition_filename("we\"ird \\name.bin"),
            "we\\\"ird \\\\name.bin"
        );
    }

    #[test]
    fn disposition_contains_original_name() {
        let name = "report final.pdf";
        let disposition = format!(
            "attachment; filename=\"{}\"",
            escape_disposition_filename(name)
        );
        assert!(disposition.contains(name));
    }
}
