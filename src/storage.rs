use async_trait::async_trait;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::models::Id;

#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("not_found")]
    NotFound,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("other: {0}")]
    Other(String),
}

/// Blob storage for post images. Keys look like `posts/<post_id>.<ext>`.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Writes (or overwrites) the blob under `key`.
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), ImageStoreError>;
    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), ImageStoreError>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), ImageStoreError>;
}

pub fn image_key(post_id: Id, extension: &str) -> String {
    format!("posts/{post_id}.{extension}")
}

/// Accepts only `posts/<digits>.<alnum ext>`, which also rules out traversal.
pub fn validate_key(key: &str) -> Result<(), ImageStoreError> {
    let invalid = || ImageStoreError::InvalidKey(key.to_string());
    let name = key.strip_prefix("posts/").ok_or_else(invalid)?;
    let (stem, ext) = name.split_once('.').ok_or_else(invalid)?;
    let stem_ok = !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit());
    let ext_ok = !ext.is_empty() && ext.len() <= 5 && ext.bytes().all(|b| b.is_ascii_alphanumeric());
    if stem_ok && ext_ok { Ok(()) } else { Err(invalid()) }
}

fn sniff_mime(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into())
}

// ---------------- Filesystem implementation ----------------
#[derive(Clone)]
pub struct FsImageStore {
    root: PathBuf,
}

impl FsImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ImageStoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn save(&self, key: &str, _mime: &str, bytes: &[u8]) -> Result<(), ImageStoreError> {
        let path = self.path_for(key)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| ImageStoreError::Other(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            error!("failed to write image key={key} path={}: {e}", path.display());
            ImageStoreError::Other(e.to_string())
        })
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), ImageStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mime = sniff_mime(&bytes);
                Ok((bytes, mime))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ImageStoreError::NotFound),
            Err(e) => Err(ImageStoreError::Other(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ImageStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ImageStoreError::Other(e.to_string())),
        }
    }
}

// ---------------- S3 implementation (MinIO compatible) ----------------
#[cfg(feature = "s3-store")]
pub struct S3ImageStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    prefix: String,
}

#[cfg(feature = "s3-store")]
impl S3ImageStore {
    pub async fn new(endpoint: String) -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "quill-media".into());
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // path-style addressing: MinIO and local endpoints lack wildcard DNS
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf).force_path_style(true).build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);

        if client.head_bucket().bucket(&bucket).send().await.is_err() {
            client
                .create_bucket()
                .bucket(&bucket)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("failed to ensure bucket '{bucket}': {e}"))?;
            info!("created bucket '{bucket}'");
        }
        info!("S3 media store ready (bucket '{bucket}')");

        Ok(Self { bucket, client, prefix: "media".into() })
    }

    fn object_key(&self, key: &str) -> Result<String, ImageStoreError> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.prefix, key))
    }
}

#[cfg(feature = "s3-store")]
#[async_trait]
impl ImageStore for S3ImageStore {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), ImageStoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        let object_key = self.object_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(mime)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| {
                error!("put_object failed key={object_key} bucket={} err={e:?}", self.bucket);
                ImageStoreError::Other(e.to_string())
            })?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), ImageStoreError> {
        let object_key = self.object_key(key)?;
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|_| ImageStoreError::NotFound)?;
        let data = obj.body.collect().await.map_err(|e| ImageStoreError::Other(e.to_string()))?;
        let bytes = data.into_bytes().to_vec();
        let mime = sniff_mime(&bytes);
        Ok((bytes, mime))
    }

    async fn delete(&self, key: &str) -> Result<(), ImageStoreError> {
        let object_key = self.object_key(key)?;
        // S3 deletes are idempotent already
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| ImageStoreError::Other(e.to_string()))?;
        Ok(())
    }
}

/// Picks S3 when built with `s3-store` and `S3_ENDPOINT` is set, the media
/// directory otherwise.
pub async fn build_image_store(media_root: PathBuf) -> anyhow::Result<Arc<dyn ImageStore>> {
    #[cfg(feature = "s3-store")]
    {
        if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
            return Ok(Arc::new(S3ImageStore::new(endpoint).await?));
        }
    }
    info!("storing media under '{}'", media_root.display());
    Ok(Arc::new(FsImageStore::new(media_root)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_post_scoped() {
        assert_eq!(image_key(42, "png"), "posts/42.png");
        assert!(validate_key("posts/42.png").is_ok());
        assert!(validate_key("posts/../etc.png").is_err());
        assert!(validate_key("posts/42").is_err());
        assert!(validate_key("other/42.png").is_err());
        assert!(validate_key("posts/42.p/g").is_err());
    }

    #[tokio::test]
    async fn fs_store_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsImageStore::new(dir.path());
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R'];
        store.save("posts/7.png", "image/png", &png).await.unwrap();
        let (bytes, mime) = store.load("posts/7.png").await.unwrap();
        assert_eq!(bytes, png);
        assert_eq!(mime, "image/png");
        store.delete("posts/7.png").await.unwrap();
        assert!(matches!(store.load("posts/7.png").await, Err(ImageStoreError::NotFound)));
        store.delete("posts/7.png").await.unwrap();
    }
}
