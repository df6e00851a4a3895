//! Integrity pass: SHA-256 digest and byte count over a stored object

use std::time::Duration;

use anyhow::{anyhow, Context};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::storage::ObjectStore;

/// Upper bound on a single integrity pass.
pub const HASH_TIMEOUT: Duration = Duration::from_secs(120);

const HASH_READ_BUF: usize = 64 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub struct HashOutcome {
    /// Lowercase 64-character hex digest.
    pub sha256_hex: String,
    pub byte_count: i64,
}

/// Stream the object at `key` back out of the store, feeding a SHA-256
/// accumulator and counting bytes along the way.
///
/// Reading from the store rather than the original upload stream keeps the
/// pass re-runnable: a later verification job can call this again and compare
/// against the persisted digest.
pub async fn hash_object(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<HashOutcome, anyhow::Error> {
    tokio::time::timeout(HASH_TIMEOUT, hash_object_inner(store, key))
        .await
        .map_err(|_| anyhow!("integrity pass timed out"))?
}

async fn hash_object_inner(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<HashOutcome, anyhow::Error> {
    let mut reader = store
        .get(key)
        .await
        .context("failed to open object for hashing")?;

    let mut hasher = Sha256::new();
    let mut byte_count: i64 = 0;
    let mut buf = vec![0u8; HASH_READ_BUF];

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .context("failed to read object bytes")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        byte_count += n as i64;
    }

    let sha256_hex = hex::encode(hasher.finalize());
    validate_digest(&sha256_hex)?;

    Ok(HashOutcome {
        sha256_hex,
        byte_count,
    })
}

/// Defensive check at the persistence boundary: 64 lowercase hex characters
/// decoding to exactly 32 bytes, nothing else gets written to the record.
pub fn validate_digest(digest: &str) -> Result<(), anyhow::Error> {
    if digest.len() != 64 {
        return Err(anyhow!("digest has wrong length: {}", digest.len()));
    }
    if !digest
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(anyhow!("digest contains non-hex or uppercase characters"));
    }
    let decoded = hex::decode(digest).context("digest is not valid hex")?;
    if decoded.len() != 32 {
        return Err(anyhow!("digest decodes to {} bytes, expected 32", decoded.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    #[tokio::test]
    async fn hashes_known_content() {
        let store = MemoryObjectStore::new();
        store.insert("uploads/x", b"hello");

        let outcome = hash_object(&store, "uploads/x").await.unwrap();
        assert_eq!(
            outcome.sha256_hex,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(outcome.byte_count, 5);
    }

    #[tokio::test]
    async fn empty_object_hashes_cleanly() {
        let store = MemoryObjectStore::new();
        store.insert("uploads/empty", b"");

        let outcome = hash_object(&store, "uploads/empty").await.unwrap();
        assert_eq!(
            outcome.sha256_hex,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(outcome.byte_count, 0);
    }

    #[tokio::test]
    async fn missing_object_is_an_error() {
        let store = MemoryObjectStore::new();
        assert!(hash_object(&store, "uploads/nothing").await.is_err());
    }

    #[test]
    fn digest_validation() {
        assert!(validate_digest(&"a".repeat(64)).is_ok());
        assert!(validate_digest(&"A".repeat(64)).is_err());
        assert!(validate_digest("deadbeef").is_err());
        assert!(validate_digest(&"g".repeat(64)).is_err());
    }
}
