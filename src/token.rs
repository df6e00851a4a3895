//! Minting and verification of signed, expiring download tokens
//!
//! A token is `b64url(payload) + "." + b64url(sig)` where the payload is a
//! small JSON document `{file_id, exp}` and the signature is HMAC-SHA256 over
//! the exact payload bytes. Possession of a valid token is the entire
//! authority to download; there is no server-side allow-list and revocation
//! happens purely through the embedded expiry.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Default TTL applied when the caller passes zero or a negative value.
pub const DEFAULT_TTL_SECS: i64 = 300;

/// Hard upper bound; anything longer would make links effectively permanent.
pub const MAX_TTL_SECS: i64 = 86_400;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub file_id: String,
    pub exp: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TokenError {
    /// Structurally broken: wrong separator count, bad base64, bad JSON,
    /// or empty claims.
    Malformed,
    /// Well-formed but the signature does not match.
    BadSignature,
    /// Signature checks out but the expiry lies in the past.
    Expired,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Malformed => write!(f, "malformed token"),
            TokenError::BadSignature => write!(f, "bad token signature"),
            TokenError::Expired => write!(f, "token expired"),
        }
    }
}

/// Clamp a requested TTL into the permitted window.
pub fn clamp_ttl(ttl_seconds: i64) -> i64 {
    if ttl_seconds <= 0 {
        DEFAULT_TTL_SECS
    } else if ttl_seconds > MAX_TTL_SECS {
        MAX_TTL_SECS
    } else {
        ttl_seconds
    }
}

fn sign(secret: &[u8], payload: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Mint a token for `file_id` expiring `ttl_seconds` (clamped) after `now`.
///
/// Returns the compact token string and the unix expiry it embeds.
pub fn mint(
    secret: &[u8],
    file_id: &str,
    ttl_seconds: i64,
    now: i64,
) -> Result<(String, i64), anyhow::Error> {
    let exp = now + clamp_ttl(ttl_seconds);
    let payload = serde_json::to_vec(&TokenClaims {
        file_id: file_id.to_string(),
        exp,
    })?;
    let sig = sign(secret, &payload)?;
    let token = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload),
        URL_SAFE_NO_PAD.encode(&sig)
    );
    Ok((token, exp))
}

/// Verify a presented token against the signing secret at time `now`.
///
/// The checks run strictly in order: structure, signature, expiry. The
/// signature comparison is constant-time via the hmac crate.
pub fn verify(secret: &[u8], token: &str, now: i64) -> Result<TokenClaims, TokenError> {
    let mut parts = token.split('.');
    let (payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(s), None) => (p, s),
        _ => return Err(TokenError::Malformed),
    };

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::Malformed)?;
    mac.update(&payload);
    mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

    let claims: TokenClaims =
        serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
    if claims.file_id.is_empty() || claims.exp == 0 {
        return Err(TokenError::Malformed);
    }

    if now > claims.exp {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn ttl_clamp() {
        assert_eq!(clamp_ttl(0), 300);
        assert_eq!(clamp_ttl(-1), 300);
        assert_eq!(clamp_ttl(60), 60);
        assert_eq!(clamp_ttl(90_000), 86_400);
        assert_eq!(clamp_ttl(86_400), 86_400);
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = 1_700_000_000;
        let (token, exp) = mint(SECRET, "some-file", 60, now).unwrap();
        assert_eq!(exp, now + 60);
        assert_eq!(verify(SECRET, &token, exp + 1), Err(TokenError::Expired));
        // Right at the boundary it is still valid.
        assert!(verify(SECRET, &token, exp).is_ok());
    }

    #[test]
    fn wrong_secret_is_a_bad_signature() {
        let (token, _) = mint(SECRET, "some-file", 60, 0).unwrap();
        assert_eq!(
            verify(b"another-secret-another-secret-ab", &token, 0),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn structural_garbage_is_malformed() {
        assert_eq!(verify(SECRET, "", 0), Err(TokenError::Malformed));
        assert_eq!(verify(SECRET, "no-separator", 0), Err(TokenError::Malformed));
        assert_eq!(verify(SECRET, "a.b.c", 0), Err(TokenError::Malformed));
        assert_eq!(
            verify(SECRET, "not base64!.also not!", 0),
            Err(TokenError::Malformed)
        );
    }

    #[test]
    fn payload_without_claims_is_malformed() {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
        // Correctly signed payload with an empty file_id must still be refused.
        let payload = serde_json::to_vec(&TokenClaims {
            file_id: String::new(),
            exp: 12345,
        })
        .unwrap();
        let sig = sign(SECRET, &payload).unwrap();
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(&sig)
        );
        assert_eq!(verify(SECRET, &token, 0), Err(TokenError::Malformed));
    }

    proptest! {
        #[test]
        fn roundtrip_preserves_claims(file_id in "[a-f0-9-]{1,64}", ttl in 1i64..=86_400) {
            let now = 1_700_000_000;
            let (token, exp) = mint(SECRET, &file_id, ttl, now).unwrap();
            prop_assert_eq!(exp, now + ttl);
            let claims = verify(SECRET, &token, now).unwrap();
            prop_assert_eq!(claims.file_id, file_id);
            prop_assert_eq!(claims.exp, exp);
        }

        #[test]
        fn any_bit_flip_in_signature_is_detected(bit in 0usize..256) {
            let now = 1_700_000_000;
            let (token, _) = mint(SECRET, "file-under-test", 600, now).unwrap();
            let (payload_b64, sig_b64) = token.split_once('.').unwrap();

            use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
            let mut sig = URL_SAFE_NO_PAD.decode(sig_b64).unwrap();
            sig[bit / 8] ^= 1 << (bit % 8);
            let tampered = format!("{payload_b64}.{}", URL_SAFE_NO_PAD.encode(&sig));

            prop_assert_eq!(verify(SECRET, &tampered, now), Err(TokenError::BadSignature));
        }
    }
}
