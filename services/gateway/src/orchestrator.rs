use crate::item::{DestinationContext, IncomingFile, ItemError, ItemOutcome};
use crate::object_store::{BlobStore, ObjectKeys, StoreError};
use crate::photo_store::{NewPhoto, PhotoRecord, RecordStore};
use crate::transform::{sniff_format, SniffedFormat, TransformEngine, VariantSet};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Fans a batch of files out across a bounded worker pool.
///
/// Each worker runs one item through validate, transform, store, record to
/// completion before taking another. The pool bound is global: it holds
/// across concurrent batch requests, not per batch. Item failures are
/// recorded as that item's outcome and never affect siblings; the batch
/// completes when every item has a terminal outcome.
pub struct BatchOrchestrator {
    transform: Arc<TransformEngine>,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    permits: Arc<Semaphore>,
    worker_concurrency: usize,
    in_flight: AtomicUsize,
}

struct StoredUrls {
    original: String,
    small: String,
    medium: String,
    large: String,
}

impl BatchOrchestrator {
    pub fn new(
        transform: Arc<TransformEngine>,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        worker_concurrency: usize,
    ) -> Self {
        let worker_concurrency = worker_concurrency.max(1);
        Self {
            transform,
            blobs,
            records,
            permits: Arc::new(Semaphore::new(worker_concurrency)),
            worker_concurrency,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Number of items currently inside the transform/store/record stages
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Process a batch, returning one outcome per item in submission order.
    #[instrument(skip(self, files), fields(destination = %destination, batch_size = files.len()))]
    pub async fn process(
        &self,
        destination: DestinationContext,
        files: Vec<IncomingFile>,
    ) -> Vec<ItemOutcome> {
        let batch_size = files.len();
        metrics::counter!("ingest.items.received").increment(batch_size as u64);

        // Completion order is arbitrary; carry the submission index so the
        // result array can be keyed back before returning.
        let mut indexed: Vec<(usize, ItemOutcome)> = stream::iter(files.into_iter().enumerate())
            .map(|(idx, file)| async move { (idx, self.process_item(destination, file).await) })
            .buffer_unordered(self.worker_concurrency)
            .collect()
            .await;

        indexed.sort_by_key(|(idx, _)| *idx);
        let outcomes: Vec<ItemOutcome> = indexed.into_iter().map(|(_, o)| o).collect();

        let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
        info!(
            batch_size = batch_size,
            succeeded = succeeded,
            failed = batch_size - succeeded,
            "Batch processing complete"
        );

        outcomes
    }

    async fn process_item(
        &self,
        destination: DestinationContext,
        file: IncomingFile,
    ) -> ItemOutcome {
        let item_key = file.item_key;
        let filename = file.filename.clone();
        let started = Instant::now();

        let result = match self.permits.acquire().await {
            Ok(_permit) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                metrics::gauge!("ingest.workers.in_flight").increment(1.0);

                let result = self.run_stages(destination, file).await;

                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                metrics::gauge!("ingest.workers.in_flight").decrement(1.0);
                result
            }
            Err(e) => Err(ItemError::Worker(format!("worker pool closed: {e}"))),
        };

        metrics::histogram!("ingest.item.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(record) => {
                metrics::counter!("ingest.items.succeeded").increment(1);
                debug!(item_key = %item_key, photo_id = %record.id, "Item committed");
            }
            Err(e) => {
                metrics::counter!("ingest.items.failed", "stage" => e.stage().as_str())
                    .increment(1);
                warn!(item_key = %item_key, stage = %e.stage(), error = %e, "Item failed");
            }
        }

        ItemOutcome {
            item_key,
            filename,
            result,
        }
    }

    /// One attempt at one item: validate, transform, store, record.
    async fn run_stages(
        &self,
        destination: DestinationContext,
        file: IncomingFile,
    ) -> Result<PhotoRecord, ItemError> {
        // validating: the declared mime type was checked at the gateway;
        // here the actual content has to look like an image
        let sniffed = sniff_format(&file.bytes).ok_or(ItemError::UnrecognizedContent)?;

        // A prior attempt may have fully committed this item. Short-circuit
        // so a client retry after an unknown-outcome crash does no new work.
        match self.records.find_by_item_key(file.item_key).await {
            Ok(Some(existing)) => {
                debug!(item_key = %file.item_key, "Item already recorded, returning existing record");
                return Ok(existing);
            }
            Ok(None) => {}
            Err(e) => {
                // The insert itself is idempotent, so continuing is safe
                warn!(item_key = %file.item_key, error = %e, "Idempotency pre-check failed");
            }
        }

        // transforming: CPU-bound, run off the async workers
        let engine = Arc::clone(&self.transform);
        let bytes = file.bytes.clone();
        let variants = tokio::task::spawn_blocking(move || engine.transform(&bytes))
            .await
            .map_err(|e| ItemError::Worker(e.to_string()))??;

        let source_width = variants.source_width;
        let source_height = variants.source_height;

        // storing: original plus every variant, or roll back to nothing
        let keys = ObjectKeys::generate(destination, &file.filename);
        let mut stored_keys: Vec<String> = Vec::new();

        let urls = match self
            .store_all(&keys, &file, sniffed, variants, &mut stored_keys)
            .await
        {
            Ok(urls) => urls,
            Err(e) => {
                self.rollback(&stored_keys).await;
                return Err(e.into());
            }
        };

        // recording: the commit point
        let new_photo = NewPhoto {
            item_key: file.item_key,
            destination: destination.as_str().to_string(),
            filename: file.filename.clone(),
            original_url: urls.original,
            thumbnail_small_url: urls.small,
            thumbnail_medium_url: urls.medium,
            thumbnail_large_url: urls.large,
            width: source_width as i32,
            height: source_height as i32,
            file_size: file.bytes.len() as i64,
            mime_type: sniffed.mime().to_string(),
        };

        match self.records.insert_photo(&new_photo).await {
            Ok(outcome) => {
                if !outcome.newly_inserted {
                    // A concurrent attempt won the insert race; the blobs
                    // stored in this attempt are unreferenced
                    self.rollback(&stored_keys).await;
                }
                Ok(outcome.record)
            }
            Err(e) => {
                self.rollback(&stored_keys).await;
                Err(e.into())
            }
        }
    }

    async fn store_all(
        &self,
        keys: &ObjectKeys,
        file: &IncomingFile,
        sniffed: SniffedFormat,
        variants: VariantSet,
        stored: &mut Vec<String>,
    ) -> Result<StoredUrls, StoreError> {
        let original_key = keys.original(sniffed.extension());
        let original = self
            .blobs
            .put(&original_key, file.bytes.to_vec(), sniffed.mime())
            .await?;
        stored.push(original_key);

        let small_key = keys.variant(variants.small.label);
        let small = self
            .blobs
            .put(&small_key, variants.small.bytes, "image/jpeg")
            .await?;
        stored.push(small_key);

        let medium_key = keys.variant(variants.medium.label);
        let medium = self
            .blobs
            .put(&medium_key, variants.medium.bytes, "image/jpeg")
            .await?;
        stored.push(medium_key);

        let large_key = keys.variant(variants.large.label);
        let large = self
            .blobs
            .put(&large_key, variants.large.bytes, "image/jpeg")
            .await?;
        stored.push(large_key);

        Ok(StoredUrls {
            original,
            small,
            medium,
            large,
        })
    }

    /// Delete any blobs stored for a failed item so no record ever
    /// references a missing or unreferenced object.
    async fn rollback(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }

        for key in keys {
            if let Err(e) = self.blobs.delete(key).await {
                warn!(key = %key, error = %e, "Failed to delete blob during rollback");
            }
        }

        metrics::counter!("ingest.items.rolled_back").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, VariantEdges};
    use crate::item::Stage;
    use crate::photo_store::{InsertOutcome, RecordError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use image::codecs::jpeg::JpegEncoder;
    use image::RgbImage;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// In-memory blob store that records peak put concurrency
    struct MemoryBlobStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        puts_in_flight: AtomicUsize,
        peak_puts: AtomicUsize,
        put_delay: Duration,
    }

    impl MemoryBlobStore {
        fn new(put_delay: Duration) -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
                puts_in_flight: AtomicUsize::new(0),
                peak_puts: AtomicUsize::new(0),
                put_delay,
            }
        }

        fn object_count(&self) -> usize {
            self.objects.lock().unwrap().len()
        }

        fn peak(&self) -> usize {
            self.peak_puts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn put(
            &self,
            key: &str,
            bytes: Vec<u8>,
            _content_type: &str,
        ) -> Result<String, StoreError> {
            let now = self.puts_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_puts.fetch_max(now, Ordering::SeqCst);

            if !self.put_delay.is_zero() {
                tokio::time::sleep(self.put_delay).await;
            }

            self.objects.lock().unwrap().insert(key.to_string(), bytes);
            self.puts_in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("https://cdn.test/{key}"))
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }

    /// In-memory record store with the same idempotent insert contract as
    /// the Postgres implementation
    struct MemoryRecordStore {
        rows: Mutex<HashMap<Uuid, PhotoRecord>>,
        fail_inserts: bool,
    }

    impl MemoryRecordStore {
        fn new() -> Self {
            Self {
                rows: Mutex::new(HashMap::new()),
                fail_inserts: false,
            }
        }

        fn failing() -> Self {
            Self {
                rows: Mutex::new(HashMap::new()),
                fail_inserts: true,
            }
        }

        fn row_count(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RecordStore for MemoryRecordStore {
        async fn insert_photo(&self, photo: &NewPhoto) -> Result<InsertOutcome, RecordError> {
            if self.fail_inserts {
                return Err(RecordError::Database(sqlx::Error::PoolClosed));
            }

            let mut rows = self.rows.lock().unwrap();
            if let Some(existing) = rows.get(&photo.item_key) {
                return Ok(InsertOutcome {
                    record: existing.clone(),
                    newly_inserted: false,
                });
            }

            let record = PhotoRecord {
                id: Uuid::new_v4(),
                item_key: photo.item_key,
                destination: photo.destination.clone(),
                filename: photo.filename.clone(),
                original_url: photo.original_url.clone(),
                thumbnail_small_url: photo.thumbnail_small_url.clone(),
                thumbnail_medium_url: photo.thumbnail_medium_url.clone(),
                thumbnail_large_url: photo.thumbnail_large_url.clone(),
                width: photo.width,
                height: photo.height,
                file_size: photo.file_size,
                mime_type: photo.mime_type.clone(),
                created_at: Utc::now(),
            };
            rows.insert(photo.item_key, record.clone());

            Ok(InsertOutcome {
                record,
                newly_inserted: true,
            })
        }

        async fn find_by_item_key(
            &self,
            item_key: Uuid,
        ) -> Result<Option<PhotoRecord>, RecordError> {
            Ok(self.rows.lock().unwrap().get(&item_key).cloned())
        }
    }

    fn test_pipeline_config(concurrency: usize) -> PipelineConfig {
        PipelineConfig {
            max_file_size_bytes: 50 * 1024 * 1024,
            max_files_per_batch: 100,
            allowed_mime_types: vec!["image/jpeg".to_string()],
            worker_concurrency: concurrency,
            variant_edges: VariantEdges::default(),
            jpeg_quality: 85,
            max_input_pixels: 268_402_689,
        }
    }

    fn build_orchestrator(
        blobs: Arc<MemoryBlobStore>,
        records: Arc<MemoryRecordStore>,
        concurrency: usize,
    ) -> BatchOrchestrator {
        let config = test_pipeline_config(concurrency);
        BatchOrchestrator::new(
            Arc::new(TransformEngine::new(&config)),
            blobs,
            records,
            concurrency,
        )
    }

    fn synth_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 100])
        });
        let mut out = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut out, 90);
        img.write_with_encoder(encoder).unwrap();
        out.into_inner()
    }

    fn incoming(filename: &str, bytes: Vec<u8>) -> IncomingFile {
        IncomingFile {
            item_key: Uuid::new_v4(),
            filename: filename.to_string(),
            content_type: "image/jpeg".to_string(),
            bytes: Bytes::from(bytes),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_corrupt_item_does_not_abort_batch() {
        let blobs = Arc::new(MemoryBlobStore::new(Duration::ZERO));
        let records = Arc::new(MemoryRecordStore::new());
        let orchestrator = build_orchestrator(blobs.clone(), records.clone(), 4);

        let mut corrupt = vec![0xFF, 0xD8, 0xFF];
        corrupt.extend_from_slice(&[0x13; 32]);

        let files = vec![
            incoming("a.jpg", synth_jpeg(640, 480)),
            incoming("b.jpg", synth_jpeg(640, 480)),
            incoming("broken.jpg", corrupt),
            incoming("c.jpg", synth_jpeg(640, 480)),
            incoming("d.jpg", synth_jpeg(640, 480)),
        ];

        let outcomes = orchestrator
            .process(DestinationContext::Event, files)
            .await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_ok());
        assert!(outcomes[3].result.is_ok());
        assert!(outcomes[4].result.is_ok());

        let err = outcomes[2].result.as_ref().unwrap_err();
        assert_eq!(err.stage(), Stage::Transforming);
        assert!(!err.retryable());

        // Exactly the 4 good items committed: one record and four blobs each
        assert_eq!(records.row_count(), 4);
        assert_eq!(blobs.object_count(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_bounds_concurrency() {
        let blobs = Arc::new(MemoryBlobStore::new(Duration::from_millis(20)));
        let records = Arc::new(MemoryRecordStore::new());
        let orchestrator = build_orchestrator(blobs.clone(), records.clone(), 2);

        let files: Vec<IncomingFile> = (0..6)
            .map(|i| incoming(&format!("photo-{i}.jpg"), synth_jpeg(320, 240)))
            .collect();

        let outcomes = orchestrator
            .process(DestinationContext::Event, files)
            .await;

        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        // Storage writes only happen while an item holds a worker permit,
        // so their peak concurrency is bounded by the pool size
        assert!(
            blobs.peak() <= 2,
            "peak put concurrency {} exceeded pool bound",
            blobs.peak()
        );
        assert_eq!(orchestrator.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_results_returned_in_submission_order() {
        let blobs = Arc::new(MemoryBlobStore::new(Duration::from_millis(5)));
        let records = Arc::new(MemoryRecordStore::new());
        let orchestrator = build_orchestrator(blobs, records, 3);

        let names: Vec<String> = (0..8).map(|i| format!("img-{i}.jpg")).collect();
        let files: Vec<IncomingFile> = names
            .iter()
            .map(|n| incoming(n, synth_jpeg(200, 150)))
            .collect();

        let outcomes = orchestrator
            .process(DestinationContext::Portfolio, files)
            .await;

        let returned: Vec<&str> = outcomes.iter().map(|o| o.filename.as_str()).collect();
        let expected: Vec<&str> = names.iter().map(String::as_str).collect();
        assert_eq!(returned, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resubmitting_item_key_creates_no_second_record() {
        let blobs = Arc::new(MemoryBlobStore::new(Duration::ZERO));
        let records = Arc::new(MemoryRecordStore::new());
        let orchestrator = build_orchestrator(blobs.clone(), records.clone(), 2);

        let file = incoming("retry-me.jpg", synth_jpeg(640, 480));
        let resubmitted = file.clone();

        let first = orchestrator
            .process(DestinationContext::Event, vec![file])
            .await;
        let first_record = first[0].result.as_ref().unwrap().clone();

        let second = orchestrator
            .process(DestinationContext::Event, vec![resubmitted])
            .await;
        let second_record = second[0].result.as_ref().unwrap().clone();

        assert_eq!(records.row_count(), 1);
        assert_eq!(first_record.id, second_record.id);
        // The retry short-circuited before storing anything new
        assert_eq!(blobs.object_count(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_record_failure_rolls_back_stored_blobs() {
        let blobs = Arc::new(MemoryBlobStore::new(Duration::ZERO));
        let records = Arc::new(MemoryRecordStore::failing());
        let orchestrator = build_orchestrator(blobs.clone(), records.clone(), 2);

        let outcomes = orchestrator
            .process(DestinationContext::Hero, vec![incoming("slide.jpg", synth_jpeg(800, 400))])
            .await;

        let err = outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(err.stage(), Stage::Recording);
        assert!(err.retryable());

        // Every blob stored for the failed item was deleted again
        assert_eq!(blobs.object_count(), 0);
        assert_eq!(records.row_count(), 0);
    }

    #[tokio::test]
    async fn test_non_image_content_rejected_in_validation() {
        let blobs = Arc::new(MemoryBlobStore::new(Duration::ZERO));
        let records = Arc::new(MemoryRecordStore::new());
        let orchestrator = build_orchestrator(blobs.clone(), records.clone(), 2);

        let outcomes = orchestrator
            .process(
                DestinationContext::Event,
                vec![incoming("fake.jpg", b"definitely not an image".to_vec())],
            )
            .await;

        let err = outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(err.stage(), Stage::Validating);
        assert_eq!(blobs.object_count(), 0);
        assert_eq!(records.row_count(), 0);
    }
}
