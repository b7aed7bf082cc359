use crate::config::Config;
use axum::body::Bytes;
use object_store::{aws::AmazonS3Builder, path::Path as ObjectPath, ObjectStore, PutPayload};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("file exceeds the {0} byte upload limit")]
    TooLarge(usize),

    #[error("unsupported file type")]
    UnsupportedType,

    #[error("file is empty")]
    Empty,

    #[error("no such file")]
    NotFound,

    #[error(transparent)]
    Store(#[from] object_store::Error),
}

const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "application/pdf",
];

/// Uploaded files live under this prefix in the bucket.
const UPLOAD_PREFIX: &str = "uploads";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub key: String,
    pub mime_type: &'static str,
}

#[derive(Clone)]
pub struct FileStore {
    store: Arc<dyn ObjectStore>,
    max_bytes: usize,
}

impl FileStore {
    pub fn new(store: Arc<dyn ObjectStore>, max_bytes: usize) -> FileStore {
        FileStore { store, max_bytes }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<FileStore> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.s3_bucket)
            .with_region(&config.s3_region)
            .with_access_key_id(&config.s3_access_key_id)
            .with_secret_access_key(&config.s3_secret_access_key);
        if let Some(endpoint) = &config.s3_endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        Ok(FileStore::new(Arc::new(builder.build()?), config.upload_max_bytes))
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Checks size and sniffed type, then stores the bytes under a content-addressed key.
    pub async fn put(&self, data: Bytes) -> Result<StoredFile, StorageError> {
        if data.is_empty() {
            return Err(StorageError::Empty);
        }
        if data.len() > self.max_bytes {
            return Err(StorageError::TooLarge(self.max_bytes));
        }
        let kind = detect(&data).ok_or(StorageError::UnsupportedType)?;

        let key = format!(
            "{UPLOAD_PREFIX}/{:x}.{}",
            Sha256::digest(&data),
            kind.extension()
        );
        self.store
            .put(&ObjectPath::from(key.as_str()), PutPayload::from(data))
            .await?;
        tracing::debug!(%key, mime = kind.mime_type(), "stored upload");

        Ok(StoredFile {
            key,
            mime_type: kind.mime_type(),
        })
    }

    /// Reads a stored file back with the content type sniffed from its bytes.
    pub async fn get(&self, key: &str) -> Result<(Bytes, String), StorageError> {
        if !key.starts_with(&format!("{UPLOAD_PREFIX}/")) || key.contains("..") {
            return Err(StorageError::NotFound);
        }

        let data = match self.store.get(&ObjectPath::from(key)).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Err(StorageError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let mime_type = detect(&data)
            .map(|k| k.mime_type().to_string())
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());

        Ok((data, mime_type))
    }
}

fn detect(data: &[u8]) -> Option<infer::Type> {
    infer::get(data).filter(|kind| ALLOWED_MIME_TYPES.contains(&kind.mime_type()))
}

pub fn proxy_url(key: &str) -> String {
    format!("/api/files/{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    const PNG_HEADER: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    fn store(max_bytes: usize) -> FileStore {
        FileStore::new(Arc::new(InMemory::new()), max_bytes)
    }

    #[tokio::test]
    async fn stores_images_under_content_key() {
        let files = store(1024);
        let stored = files.put(Bytes::from_static(PNG_HEADER)).await.unwrap();
        assert!(stored.key.starts_with("uploads/"));
        assert!(stored.key.ends_with(".png"));
        assert_eq!(stored.mime_type, "image/png");

        let again = files.put(Bytes::from_static(PNG_HEADER)).await.unwrap();
        assert_eq!(stored.key, again.key);

        let (data, mime_type) = files.get(&stored.key).await.unwrap();
        assert_eq!(&data[..], PNG_HEADER);
        assert_eq!(mime_type, "image/png");
    }

    #[tokio::test]
    async fn rejects_unknown_and_oversized_files() {
        let files = store(8);
        assert!(matches!(
            files.put(Bytes::from_static(b"plain")).await,
            Err(StorageError::UnsupportedType)
        ));
        assert!(matches!(
            files.put(Bytes::from_static(PNG_HEADER)).await,
            Err(StorageError::TooLarge(8))
        ));
        assert!(matches!(
            files.put(Bytes::new()).await,
            Err(StorageError::Empty)
        ));
    }

    #[tokio::test]
    async fn missing_and_foreign_keys_are_not_found() {
        let files = store(1024);
        assert!(matches!(
            files.get("uploads/nope.png").await,
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            files.get("private/secret.pdf").await,
            Err(StorageError::NotFound)
        ));
    }
}
