use crate::config::S3Config;
use crate::item::DestinationContext;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Storage adapter failure, classified for retry decisions
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity-level failure; safe to retry
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Auth, quota, or other service rejection; retrying will not help
    #[error("storage error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Durable blob storage seam.
///
/// `put` persists the bytes under `key` and returns the public URL the
/// object is retrievable from; `delete` is used to roll back partially
/// stored items.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// S3-backed blob store for photo originals and variants
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    public_base_url: String,
    retry_initial_delay: Duration,
    retry_max_elapsed: Duration,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/R2/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            retry_initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            retry_max_elapsed: Duration::from_secs(config.retry_max_elapsed_secs),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    async fn put_once(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_initial_delay)
            .with_max_elapsed_time(Some(self.retry_max_elapsed))
            .build();

        backoff::future::retry(policy, || async {
            self.put_once(key, &bytes, content_type)
                .await
                .map_err(|e| {
                    if e.is_transient() {
                        warn!(key = %key, error = %e, "Transient storage error, will retry");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
        })
        .await?;

        debug!(key = %key, "Blob stored");
        Ok(self.object_url(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        debug!(key = %key, "Blob deleted");
        Ok(())
    }
}

/// Classify an SDK error: dispatch/timeout failures are connectivity-level
/// and retryable; anything the service actually answered is permanent.
fn classify_sdk_error<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(format!("{}", DisplayErrorContext(&err)))
        }
        _ => StoreError::Permanent(format!("{}", DisplayErrorContext(&err))),
    }
}

/// Generated storage keys for one item.
///
/// Keys are derived, never taken verbatim from user filenames: the stem is
/// sanitized and a timestamp + random token suffix disambiguates collisions
/// instead of overwriting.
#[derive(Debug, Clone)]
pub struct ObjectKeys {
    prefix: &'static str,
    date: String,
    stem: String,
}

impl ObjectKeys {
    pub fn generate(destination: DestinationContext, filename: &str) -> Self {
        let now = Utc::now();
        let token = Uuid::new_v4().simple().to_string();
        let stem = format!(
            "{}-{}-{}",
            sanitize_filename_stem(filename),
            now.format("%Y%m%d%H%M%S%3f"),
            &token[..8]
        );

        Self {
            prefix: destination.key_prefix(),
            date: now.format("%Y-%m-%d").to_string(),
            stem,
        }
    }

    pub fn original(&self, extension: &str) -> String {
        format!(
            "{}/{}/originals/{}.{}",
            self.prefix, self.date, self.stem, extension
        )
    }

    pub fn variant(&self, label: &str) -> String {
        format!(
            "{}/{}/thumbnails/{}-{}.jpg",
            self.prefix, self.date, self.stem, label
        )
    }
}

/// Reduce a user-supplied filename to a safe key component: drop any path,
/// drop the extension, keep `[A-Za-z0-9._-]`, strip leading dots.
fn sanitize_filename_stem(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);

    let stem = match base.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => base,
    };

    let cleaned: String = stem
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.').to_string();

    if cleaned.is_empty() {
        "photo".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_stem() {
        assert_eq!(sanitize_filename_stem("wedding-042.jpg"), "wedding-042");
        assert_eq!(sanitize_filename_stem("my photo.png"), "my_photo");
        assert_eq!(sanitize_filename_stem("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename_stem(".hidden.jpg"), "hidden");
        assert_eq!(sanitize_filename_stem("...."), "photo");
        assert_eq!(sanitize_filename_stem("C:\\photos\\img.jpg"), "img");
    }

    #[test]
    fn test_object_keys_layout() {
        let keys = ObjectKeys::generate(DestinationContext::Event, "reception.jpg");
        let original = keys.original("jpg");
        let small = keys.variant("small");

        assert!(original.starts_with("events/"));
        assert!(original.contains("/originals/"));
        assert!(original.contains("reception"));
        assert!(original.ends_with(".jpg"));
        assert!(small.contains("/thumbnails/"));
        assert!(small.ends_with("-small.jpg"));
    }

    #[test]
    fn test_object_keys_unique_for_same_filename() {
        let a = ObjectKeys::generate(DestinationContext::Portfolio, "dup.jpg");
        let b = ObjectKeys::generate(DestinationContext::Portfolio, "dup.jpg");
        assert_ne!(a.original("jpg"), b.original("jpg"));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Transient("reset".into()).is_transient());
        assert!(!StoreError::Permanent("denied".into()).is_transient());
    }
}
