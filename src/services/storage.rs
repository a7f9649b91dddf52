use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};

use crate::core::config::Settings;

/// Location and fingerprint of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredBlob {
    pub(crate) storage_ref: String,
    pub(crate) size_bytes: i64,
    pub(crate) sha256_hex: String,
}

#[async_trait]
pub(crate) trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, content_type: &str, bytes: Vec<u8>)
        -> anyhow::Result<StoredBlob>;

    async fn get(&self, storage_ref: &str) -> anyhow::Result<Vec<u8>>;
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Object key for an artifact; `exam_session` is expected to be sanitised already.
pub(crate) fn artifact_key(exam_session: &str, artifact_id: &str, extension: &str) -> String {
    format!("artifacts/{exam_session}/{artifact_id}.{extension}")
}

#[derive(Debug, Clone)]
pub(crate) struct StorageService {
    client: Client,
    bucket: String,
}

impl StorageService {
    pub(crate) async fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        if settings.s3().access_key.is_empty() || settings.s3().secret_key.is_empty() {
            return Ok(None);
        }

        let creds = Credentials::new(
            settings.s3().access_key.clone(),
            settings.s3().secret_key.clone(),
            None,
            None,
            "scanbridge-static",
        );

        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(settings.s3().endpoint.clone())
            .region(aws_config::Region::new(settings.s3().region.clone()))
            .credentials_provider(creds)
            .load()
            .await;

        let client = Client::new(&config);

        Ok(Some(Self { client, bucket: settings.s3().bucket.clone() }))
    }
}

#[async_trait]
impl BlobStore for StorageService {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<StoredBlob> {
        let size_bytes = bytes.len() as i64;
        let sha256_hex = sha256_hex(&bytes);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| format!("Failed to store object {key}"))?;

        Ok(StoredBlob { storage_ref: key.to_string(), size_bytes, sha256_hex })
    }

    async fn get(&self, storage_ref: &str) -> anyhow::Result<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(storage_ref)
            .send()
            .await
            .with_context(|| format!("Failed to fetch object {storage_ref}"))?;

        let data = object
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read object body {storage_ref}"))?;
        Ok(data.into_bytes().to_vec())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::test_support;

    /// In-process blob store for service and router tests.
    #[derive(Default)]
    pub(crate) struct MemoryBlobStore {
        pub(crate) objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn put(
            &self,
            key: &str,
            _content_type: &str,
            bytes: Vec<u8>,
        ) -> anyhow::Result<StoredBlob> {
            let blob = StoredBlob {
                storage_ref: key.to_string(),
                size_bytes: bytes.len() as i64,
                sha256_hex: sha256_hex(&bytes),
            };
            self.objects.lock().unwrap().insert(key.to_string(), bytes);
            Ok(blob)
        }

        async fn get(&self, storage_ref: &str) -> anyhow::Result<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(storage_ref)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such object {storage_ref}"))
        }
    }

    #[test]
    fn artifact_keys_are_grouped_by_session() {
        assert_eq!(artifact_key("2025-nov", "abc", "pdf"), "artifacts/2025-nov/abc.pdf");
    }

    #[test]
    fn hashes_are_lowercase_hex_sha256() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn storage_is_disabled_without_credentials() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        assert!(StorageService::from_settings(&settings).await.expect("storage").is_none());
    }

    #[tokio::test]
    async fn memory_store_round_trips_bytes() {
        let store = MemoryBlobStore::default();
        let blob = store.put("artifacts/s/a.pdf", "application/pdf", b"%PDF".to_vec()).await.unwrap();
        assert_eq!(blob.size_bytes, 4);
        assert_eq!(store.get(&blob.storage_ref).await.unwrap(), b"%PDF".to_vec());
        assert!(store.get("missing").await.is_err());
    }
}
