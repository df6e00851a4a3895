//! Stateless signed session cookies: login, logout, registration and the auth middleware

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use axum_extra::extract::CookieJar;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::prelude::Utc;
use cookie::{time::Duration, Cookie};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::*;

type HmacSha256 = Hmac<Sha256>;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "sfd_session";

/// Claims carried inside the session cookie. `sub` is the user id, or the
/// literal "admin" for the configuration-supplied bootstrap account.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    pub sub: String,
    pub exp: i64,
}

/// The authenticated caller, stashed in request extensions by [require_auth].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
}

impl AuthUser {
    /// The bootstrap admin authenticated against the config hash rather than
    /// a database row.
    pub fn is_bootstrap_admin(&self) -> bool {
        self.id == "admin"
    }
}

/// Encode and sign session claims into the cookie value:
/// `b64url(payload) + "." + hex(HMAC-SHA256(secret, payload))`.
///
/// Note the signature is hex here, unlike the base64url-signed download
/// tokens; the two artifacts are deliberately not interchangeable.
pub fn encode_session(secret: &[u8], sub: &str, exp: i64) -> Result<String, anyhow::Error> {
    let payload = serde_json::to_vec(&SessionClaims {
        sub: sub.to_string(),
        exp,
    })?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(payload_b64.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    Ok(format!("{payload_b64}.{sig}"))
}

/// Validate a presented cookie value. Any structural problem, signature
/// mismatch or expired claim yields None; callers answer 401 uniformly.
pub fn decode_session(secret: &[u8], value: &str, now: i64) -> Option<SessionClaims> {
    let (payload_b64, sig_hex) = value.split_once('.')?;
    let sig = hex::decode(sig_hex).ok()?;

    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&sig).ok()?;

    let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let claims: SessionClaims = serde_json::from_slice(&payload).ok()?;
    if claims.sub.is_empty() || now > claims.exp {
        return None;
    }
    Some(claims)
}

fn build_session_cookie(value: String, max_age: Duration, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, value))
        .http_only(true)
        .secure(secure)
        .same_site(cookie::SameSite::Lax)
        .path("/")
        .max_age(max_age)
        .build()
}

/// Middleware guarding all cookie-authenticated routes.
///
/// On success the [AuthUser] is placed in request extensions for handlers to
/// pick up; everything else is a uniform 401.
pub async fn require_auth(
    State(aps): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let value = jar
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(|| AppError::unauthenticated("missing session cookie"))?;

    let claims = decode_session(
        aps.conf.session_secret.as_bytes(),
        &value,
        Utc::now().timestamp(),
    )
    .ok_or_else(|| AppError::unauthenticated("invalid or expired session"))?;

    req.extensions_mut().insert(AuthUser { id: claims.sub });
    Ok(next.run(req).await)
}

/// Check that the caller is an administrator: either the bootstrap admin or a
/// database user with the admin flag.
pub async fn require_admin(aps: &AppState, auth: &AuthUser) -> Result<(), AppError> {
    if auth.is_bootstrap_admin() {
        return Ok(());
    }
    let user = db::fetch_user_by_id(&aps.db, &auth.id)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
        .ok_or_else(|| AppError::unauthenticated("unknown user"))?;
    if user.is_admin {
        Ok(())
    } else {
        Err(AppError::forbidden("administrator access required"))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

/// POST /login
///
/// Tries the database first (bcrypt verify, verified email required), then
/// falls back to the bootstrap admin hash from the configuration. Failed
/// attempts feed the lockout ledger.
pub async fn login_endpoint(
    State(aps): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, StatusCode), AppError> {
    let username = req.username.trim().to_string();
    if username.is_empty() || req.password.is_empty() {
        return AppError::err(StatusCode::BAD_REQUEST, "username and password are required");
    }

    let now = Utc::now().timestamp();
    if aps.lockout.is_locked(&username, now) {
        // Deliberately refused before any password check.
        return AppError::err(StatusCode::UNAUTHORIZED, "account temporarily locked");
    }

    let mut sub: Option<String> = None;

    match db::fetch_user_by_username(&aps.db, &username)
        .await
        .map_err(|e| AppError::server_error(format!("database error: {e}")))?
    {
        Some(user) => {
            let password_ok = bcrypt::verify(&req.password, &user.password_hash).unwrap_or(false);
            if password_ok && user.email_verified {
                sub = Some(user.id);
            }
        }
        None => {
            // Bootstrap admin: no database row, hash lives in the config.
            if username == "admin"
                && bcrypt::verify(&req.password, &aps.conf.admin_password_hash).unwrap_or(false)
            {
                sub = Some("admin".to_string());
            }
        }
    }

    let Some(sub) = sub else {
        aps.lockout.record_failure(&username, now);
        tracing::info!(username, "failed login attempt");
        return AppError::err(StatusCode::UNAUTHORIZED, "invalid credentials");
    };

    aps.lockout.record_success(&username);

    let ttl_hours = aps.conf.session_ttl_hours;
    let exp = now + ttl_hours * 3600;
    let value = encode_session(aps.conf.session_secret.as_bytes(), &sub, exp)?;
    let cookie = build_session_cookie(value, Duration::hours(ttl_hours), aps.conf.secure_cookies);

    tracing::info!(username, "successful login");
    Ok((jar.add(cookie), StatusCode::OK))
}

/// POST /logout - overwrite the cookie with an expired empty value.
pub async fn logout_endpoint(
    State(aps): State<AppState>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    let cookie = build_session_cookie(String::new(), Duration::seconds(0), aps.conf.secure_cookies);
    (jar.add(cookie), StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    email: String,
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    id: String,
    email: String,
    username: String,
}

/// POST /register - create a new account.
///
/// The account starts out unverified; flipping `email_verified` is the job of
/// an outbound verification side-channel.
pub async fn register_endpoint(
    State(aps): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let email = req.email.trim().to_string();
    let username = req.username.trim().to_string();

    if email.is_empty() || !email.contains('@') {
        return AppError::err(StatusCode::BAD_REQUEST, "invalid email address");
    }
    if username.is_empty() || username.len() > 64 {
        return AppError::err(StatusCode::BAD_REQUEST, "invalid username");
    }
    if req.password.len() < 8 {
        return AppError::err(StatusCode::BAD_REQUEST, "password must be at least 8 characters");
    }

    let password_hash = bcrypt::hash(&req.password, bcrypt::DEFAULT_COST)
        .map_err(|e| AppError::server_error(format!("failed to hash password: {e}")))?;

    let id = db::new_id();
    let insert = db::insert_user(
        &aps.db,
        db::NewUser {
            id: &id,
            email: &email,
            username: &username,
            password_hash: &password_hash,
            is_admin: false,
            storage_quota_bytes: None,
        },
    )
    .await;

    if let Err(e) = insert {
        if e.as_database_error()
            .map_or(false, |d| d.is_unique_violation())
        {
            return AppError::err(StatusCode::CONFLICT, "email or username already taken");
        }
        return Err(AppError::server_error(format!("database error: {e}")));
    }

    tracing::info!(username, "registered new user");
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id,
            email,
            username,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"session-secret-session-secret-ab";

    #[test]
    fn cookie_roundtrip() {
        let value = encode_session(SECRET, "user-123", 2_000_000_000).unwrap();
        let claims = decode_session(SECRET, &value, 1_700_000_000).unwrap();
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.exp, 2_000_000_000);
    }

    #[test]
    fn cookie_signature_is_hex() {
        let value = encode_session(SECRET, "user-123", 2_000_000_000).unwrap();
        let (_, sig) = value.split_once('.').unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn expired_cookie_is_rejected() {
        let value = encode_session(SECRET, "user-123", 1_000).unwrap();
        assert!(decode_session(SECRET, &value, 1_001).is_none());
        assert!(decode_session(SECRET, &value, 1_000).is_some());
    }

    #[test]
    fn tampered_cookie_is_rejected() {
        let value = encode_session(SECRET, "user-123", 2_000_000_000).unwrap();
        let (payload, sig) = value.split_once('.').unwrap();

        // Flip one nibble of the hex signature.
        let mut sig_bytes: Vec<char> = sig.chars().collect();
        sig_bytes[0] = if sig_bytes[0] == '0' { '1' } else { '0' };
        let tampered: String = sig_bytes.into_iter().collect();
        assert!(decode_session(SECRET, &format!("{payload}.{tampered}"), 0).is_none());

        // Swap in a different payload under the original signature.
        let other = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&SessionClaims {
                sub: "someone-else".into(),
                exp: 2_000_000_000,
            })
            .unwrap(),
        );
        assert!(decode_session(SECRET, &format!("{other}.{sig}"), 0).is_none());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let value = encode_session(SECRET, "user-123", 2_000_000_000).unwrap();
        assert!(decode_session(b"download-secret-not-session-pls!", &value, 0).is_none());
    }
}
