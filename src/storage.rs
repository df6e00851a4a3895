//! Object store client streaming file bytes to and from an S3-compatible bucket

use std::path::Path;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use tokio::io::AsyncRead;

use crate::config::AppConfiguration;

/// Fixed prefix under which all objects live. Keys are derived exclusively
/// from server-generated file ids and never from client input.
pub const OBJECT_KEY_PREFIX: &str = "uploads/";

/// Derive the storage locator for a file id.
pub fn object_key_for(file_id: &str) -> String {
    format!("{OBJECT_KEY_PREFIX}{file_id}")
}

/// Byte source handed back by [ObjectStore::get]; streamed, never buffered whole.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// The seam between the file lifecycle and the bytes' actual home.
///
/// Production uses [S3ObjectStore]; tests swap in [MemoryObjectStore] so the
/// pipeline and reaper can be exercised without a running bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `path` under `key`, replacing any previous object.
    async fn put_path(&self, key: &str, path: &Path) -> Result<(), anyhow::Error>;

    /// Open a streaming reader over the object's bytes.
    async fn get(&self, key: &str) -> Result<ObjectReader, anyhow::Error>;

    /// Remove the object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;

    /// List all keys under the given prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error>;

    /// Cheap reachability probe for the readiness endpoint.
    async fn ready(&self) -> Result<(), anyhow::Error>;
}

/// S3-compatible implementation. One process-wide instance; the SDK client is
/// internally reference-counted and safe to share.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn from_config(conf: &AppConfiguration) -> Self {
        let credentials = Credentials::new(
            conf.s3_access_key.clone(),
            conf.s3_secret_key.clone(),
            None,
            None,
            "config",
        );
        let shared_config = aws_config::from_env()
            .credentials_provider(credentials)
            .region(Region::new(conf.s3_region.clone()))
            .endpoint_url(conf.s3_endpoint.clone())
            .load()
            .await;
        // Path-style addressing keeps MinIO and friends happy.
        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(s3_config),
            bucket: conf.s3_bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_path(&self, key: &str, path: &Path) -> Result<(), anyhow::Error> {
        let body = ByteStream::read_from()
            .path(path)
            .build()
            .await
            .context("failed to open staged upload for reading")?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("put_object failed: {e}"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ObjectReader, anyhow::Error> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("get_object failed: {e}"))?;
        Ok(Box::new(output.body.into_async_read()))
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        // S3 treats deleting a missing key as success, which matches the
        // best-effort contract of the reaper.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("delete_object failed: {e}"))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| anyhow!("list_objects failed: {e}"))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(keys)
    }

    async fn ready(&self) -> Result<(), anyhow::Error> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| anyhow!("head_bucket failed: {e}"))?;
        Ok(())
    }
}

/// In-memory object store used by the test suite.
#[cfg(test)]
pub struct MemoryObjectStore {
    objects: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

#[cfg(test)]
impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn insert(&self, key: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }
}

#[cfg(test)]
#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_path(&self, key: &str, path: &Path) -> Result<(), anyhow::Error> {
        let bytes = tokio::fs::read(path).await?;
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ObjectReader, anyhow::Error> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no such object: {key}"))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ready(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_prefixed_and_deterministic() {
        let id = "0192fdc0-2f2b-7e1a-b1c5-d0516b2b7a34";
        assert_eq!(object_key_for(id), format!("uploads/{id}"));
        assert_eq!(object_key_for(id), object_key_for(id));
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        use tokio::io::AsyncReadExt;

        let store = MemoryObjectStore::new();
        store.insert("uploads/a", b"hello");

        let mut reader = store.get("uploads/a").await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");

        assert_eq!(store.list("uploads/").await.unwrap(), vec!["uploads/a"]);

        store.delete("uploads/a").await.unwrap();
        assert!(!store.contains("uploads/a"));
        // Deleting twice stays quiet.
        store.delete("uploads/a").await.unwrap();
    }
}
