use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Committed photo metadata. A row exists if and only if every variant of
/// the photo was durably stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PhotoRecord {
    /// Unique record ID
    pub id: Uuid,
    /// Client-assigned idempotency key for the upload item
    pub item_key: Uuid,
    /// Destination context the photo was uploaded into
    pub destination: String,
    /// Original filename as submitted
    pub filename: String,
    /// URL of the stored original
    pub original_url: String,
    /// URL of the small thumbnail
    pub thumbnail_small_url: String,
    /// URL of the medium thumbnail
    pub thumbnail_medium_url: String,
    /// URL of the large thumbnail
    pub thumbnail_large_url: String,
    /// Source image width
    pub width: i32,
    /// Source image height
    pub height: i32,
    /// Original file size in bytes
    pub file_size: i64,
    /// Detected mime type of the original
    pub mime_type: String,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Fields for a new photo record
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub item_key: Uuid,
    pub destination: String,
    pub filename: String,
    pub original_url: String,
    pub thumbnail_small_url: String,
    pub thumbnail_medium_url: String,
    pub thumbnail_large_url: String,
    pub width: i32,
    pub height: i32,
    pub file_size: i64,
    pub mime_type: String,
}

/// Result of an idempotent insert
#[derive(Debug)]
pub struct InsertOutcome {
    pub record: PhotoRecord,
    /// False when a record for this item key already existed
    pub newly_inserted: bool,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record for item key {0} missing after conflicting insert")]
    MissingAfterConflict(Uuid),
}

/// Metadata recorder seam.
///
/// `insert_photo` is the per-item commit point: keyed by the item's
/// idempotency key, and a duplicate insert is a no-op success returning the
/// existing row.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_photo(&self, photo: &NewPhoto) -> Result<InsertOutcome, RecordError>;

    async fn find_by_item_key(&self, item_key: Uuid) -> Result<Option<PhotoRecord>, RecordError>;
}

/// Postgres-backed photo metadata store
pub struct PgPhotoStore {
    pool: PgPool,
}

const PHOTO_COLUMNS: &str = "id, item_key, destination, filename, original_url, \
     thumbnail_small_url, thumbnail_medium_url, thumbnail_large_url, \
     width, height, file_size, mime_type, created_at";

impl PgPhotoStore {
    /// Create a new photo store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgPhotoStore {
    #[instrument(skip(self, photo), fields(item_key = %photo.item_key, filename = %photo.filename))]
    async fn insert_photo(&self, photo: &NewPhoto) -> Result<InsertOutcome, RecordError> {
        let sql = format!(
            "INSERT INTO photos ({PHOTO_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW()) \
             ON CONFLICT (item_key) DO NOTHING \
             RETURNING {PHOTO_COLUMNS}"
        );

        let inserted = sqlx::query_as::<_, PhotoRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(photo.item_key)
            .bind(&photo.destination)
            .bind(&photo.filename)
            .bind(&photo.original_url)
            .bind(&photo.thumbnail_small_url)
            .bind(&photo.thumbnail_medium_url)
            .bind(&photo.thumbnail_large_url)
            .bind(photo.width)
            .bind(photo.height)
            .bind(photo.file_size)
            .bind(&photo.mime_type)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(record) => {
                debug!(photo_id = %record.id, "Photo record created");
                metrics::counter!("ingest.records.created").increment(1);
                Ok(InsertOutcome {
                    record,
                    newly_inserted: true,
                })
            }
            None => {
                // A prior attempt for this item key already committed
                let existing = self
                    .find_by_item_key(photo.item_key)
                    .await?
                    .ok_or(RecordError::MissingAfterConflict(photo.item_key))?;

                debug!(photo_id = %existing.id, "Duplicate insert treated as no-op");
                metrics::counter!("ingest.records.duplicate_noop").increment(1);
                Ok(InsertOutcome {
                    record: existing,
                    newly_inserted: false,
                })
            }
        }
    }

    async fn find_by_item_key(&self, item_key: Uuid) -> Result<Option<PhotoRecord>, RecordError> {
        let sql = format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE item_key = $1");

        let record = sqlx::query_as::<_, PhotoRecord>(&sql)
            .bind(item_key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_photo_carries_all_variant_urls() {
        let photo = NewPhoto {
            item_key: Uuid::new_v4(),
            destination: "event".to_string(),
            filename: "reception.jpg".to_string(),
            original_url: "https://cdn/x.jpg".to_string(),
            thumbnail_small_url: "https://cdn/x-small.jpg".to_string(),
            thumbnail_medium_url: "https://cdn/x-medium.jpg".to_string(),
            thumbnail_large_url: "https://cdn/x-large.jpg".to_string(),
            width: 1600,
            height: 1200,
            file_size: 2_000_000,
            mime_type: "image/jpeg".to_string(),
        };

        assert_eq!(photo.destination, "event");
        assert!(photo.thumbnail_large_url.ends_with("-large.jpg"));
    }
}
