use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    presigning::PresigningConfig,
    Client,
};
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::StorageConfig;

/// Failure reading an object back. Callers treat `NotFound` as permanent and
/// `Unavailable` as transient.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()>;
    async fn get_object(&self, key: &str) -> Result<Bytes, StorageError>;
    async fn delete_object(&self, key: &str) -> anyhow::Result<()>;
    async fn presign_get(&self, key: &str, seconds: u64) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(
        endpoint: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
        region: &str,
    ) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "static",
            ))
            .endpoint_url(endpoint)
            .load()
            .await;

        let conf = S3ConfigBuilder::from(&shared)
            .endpoint_url(endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            bucket: bucket.to_string(),
        })
    }

    pub async fn from_config(cfg: &StorageConfig) -> anyhow::Result<Self> {
        Self::new(
            &cfg.endpoint,
            &cfg.bucket,
            &cfg.access_key,
            &cfg.secret_key,
            &cfg.region,
        )
        .await
    }
}

#[async_trait]
impl StorageClient for Storage {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("s3 put_object")?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, StorageError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    return Err(StorageError::NotFound(key.to_string()));
                }
                return Err(StorageError::Unavailable(service.to_string()));
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(data.into_bytes())
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 delete_object")?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, seconds: u64) -> anyhow::Result<String> {
        let req = self.client.get_object().bucket(&self.bucket).key(key);
        let presigned = req
            .presigned(PresigningConfig::expires_in(
                std::time::Duration::from_secs(seconds),
            )?)
            .await
            .context("s3 presign_get")?;
        Ok(presigned.uri().to_string())
    }
}

/// Process-local blob store for offline runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, (Bytes, String)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl StorageClient for MemoryStorage {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|(body, _)| body.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, seconds: u64) -> anyhow::Result<String> {
        Ok(format!("memory://{}?expires={}", key, seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_round_trips_and_reports_missing_keys() {
        let storage = MemoryStorage::new();
        storage
            .put_object("drafts/a.jpg", Bytes::from_static(b"\x01\x02"), "image/jpeg")
            .await
            .unwrap();

        let body = storage.get_object("drafts/a.jpg").await.unwrap();
        assert_eq!(&body[..], b"\x01\x02");

        storage.delete_object("drafts/a.jpg").await.unwrap();
        let err = storage.get_object("drafts/a.jpg").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(key) if key == "drafts/a.jpg"));
    }

    #[tokio::test]
    async fn memory_presign_embeds_key() {
        let storage = MemoryStorage::new();
        let url = storage.presign_get("x/y/z.png", 60).await.unwrap();
        assert!(url.contains("x/y/z.png"));
    }
}
