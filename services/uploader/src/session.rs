//! Upload session management: a persisted queue of pending files that
//! survives process restarts and connectivity loss.
//!
//! Every status mutation is followed by a write-through persistence write,
//! so the only work ever repeated after a crash is work whose outcome was
//! genuinely unknown. The persisted file is a shared contract: any process
//! that can read and write it (a foreground run or a companion background
//! sender) may perform sends under the same item-id keying, and the
//! server-side idempotency key keeps duplicate sends harmless.

use crate::item::{ItemResult, ItemStatus, UploadBatch, UploadItem};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Durable storage for the active upload batch
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persist the batch atomically (temp file + rename), so a crash
    /// mid-write never corrupts the queue.
    pub fn save(&self, batch: &UploadBatch) -> Result<()> {
        let json = serde_json::to_vec_pretty(batch).context("Failed to serialize upload batch")?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &json)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }

    /// Read the last persisted batch, if any
    pub fn load(&self) -> Result<Option<UploadBatch>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = fs::read(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let batch = serde_json::from_slice(&json).context("Failed to parse upload batch")?;

        Ok(Some(batch))
    }

    /// Remove the persisted batch
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Owns the active batch and drives every status mutation through the
/// persisted store.
pub struct SessionManager {
    store: SessionStore,
    batch: UploadBatch,
    max_retries: u32,
}

impl SessionManager {
    /// Start a fresh session
    pub fn create(store: SessionStore, destination: &str, max_retries: u32) -> Self {
        Self {
            store,
            batch: UploadBatch::new(destination),
            max_retries,
        }
    }

    /// Resume the last persisted session, if one exists.
    ///
    /// Items left `uploading`/`processing` by a prior crash have unknown
    /// outcomes; they are reset to `queued` for re-submission. The server's
    /// idempotency key prevents duplicate records if they had in fact
    /// committed.
    pub fn restore(store: SessionStore, max_retries: u32) -> Result<Option<Self>> {
        let Some(mut batch) = store.load()? else {
            return Ok(None);
        };

        let mut reset = 0;
        for item in &mut batch.items {
            if matches!(item.status, ItemStatus::Uploading | ItemStatus::Processing) {
                item.status = ItemStatus::Queued;
                item.progress_percent = 0;
                reset += 1;
            }
        }

        if reset > 0 {
            info!(
                session_id = %batch.session_id,
                reset = reset,
                "Reset in-flight items from prior session to queued"
            );
            store.save(&batch)?;
        }

        Ok(Some(Self {
            store,
            batch,
            max_retries,
        }))
    }

    pub fn batch(&self) -> &UploadBatch {
        &self.batch
    }

    /// Add files to the queue. The batch is persisted before any network
    /// traffic, so a crash before the first byte leaves a resumable record.
    pub fn enqueue(&mut self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            match UploadItem::new(path) {
                Ok(item) => {
                    debug!(filename = %item.filename, id = %item.id, "Enqueued file");
                    self.batch.items.push(item);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                }
            }
        }

        self.persist()
    }

    /// Next item awaiting a send
    pub fn next_queued(&self) -> Option<UploadItem> {
        self.batch.queued().next().cloned()
    }

    /// Apply a status transition and persist it. Illegal transitions are
    /// rejected and logged rather than silently applied.
    pub fn set_status(&mut self, id: Uuid, next: ItemStatus) -> Result<()> {
        let Some(item) = self.batch.items.iter_mut().find(|item| item.id == id) else {
            warn!(id = %id, "Status update for unknown item");
            return Ok(());
        };

        if !item.status.can_transition(next) {
            warn!(
                id = %id,
                from = %item.status,
                to = %next,
                "Ignoring illegal status transition"
            );
            return Ok(());
        }

        item.status = next;
        if next == ItemStatus::Done {
            item.progress_percent = 100;
        }

        self.persist()
    }

    /// Record progress for an in-flight item (memory only; progress is not
    /// a status transition and does not hit the store on every chunk)
    pub fn set_progress(&mut self, id: Uuid, percent: u8) {
        if let Some(item) = self.batch.items.iter_mut().find(|item| item.id == id) {
            item.progress_percent = percent.min(100);
        }
    }

    /// Record a transport-level failure for an item and decide whether it
    /// goes back into the queue.
    pub fn record_failure(&mut self, id: Uuid, error: String, retryable: bool) -> Result<()> {
        let Some(item) = self.batch.items.iter_mut().find(|item| item.id == id) else {
            warn!(id = %id, "Failure recorded for unknown item");
            return Ok(());
        };

        item.status = ItemStatus::Failed;
        item.retry_count += 1;
        item.last_error = Some(error);
        item.progress_percent = 0;

        if retryable && item.retry_count < self.max_retries {
            debug!(
                id = %id,
                retry_count = item.retry_count,
                "Re-queueing item after retryable failure"
            );
            item.status = ItemStatus::Queued;
        }

        self.persist()
    }

    /// Reset items that were in flight when the run was cancelled
    pub fn reset_in_flight(&mut self) -> Result<()> {
        for item in &mut self.batch.items {
            if matches!(item.status, ItemStatus::Uploading | ItemStatus::Processing) {
                item.status = ItemStatus::Queued;
                item.progress_percent = 0;
            }
        }
        self.persist()
    }

    /// Apply the gateway's per-item results: success becomes `done` and is
    /// dropped from the active queue, failure is retried up to the ceiling
    /// and then surfaced.
    pub fn reconcile(&mut self, results: &[ItemResult]) -> Result<()> {
        for result in results {
            let Some(item) = self
                .batch
                .items
                .iter_mut()
                .find(|item| item.id == result.item_key)
            else {
                warn!(item_key = %result.item_key, "Result for unknown item");
                continue;
            };

            if result.success {
                item.status = ItemStatus::Done;
                item.progress_percent = 100;
                item.last_error = None;
            } else {
                item.status = ItemStatus::Failed;
                item.retry_count += 1;
                item.last_error = result.error.clone();
                item.progress_percent = 0;

                let retryable = result.retryable.unwrap_or(false);
                if retryable && item.retry_count < self.max_retries {
                    item.status = ItemStatus::Queued;
                }
            }
        }

        // Completed items leave the active queue
        self.batch
            .items
            .retain(|item| item.status != ItemStatus::Done);

        if self.batch.items.is_empty() {
            info!(session_id = %self.batch.session_id, "All items done, clearing session");
            self.store.clear()
        } else {
            self.persist()
        }
    }

    /// Items that exhausted their retries and need user attention
    pub fn failed_items(&self) -> Vec<&UploadItem> {
        self.batch
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .collect()
    }

    fn persist(&self) -> Result<()> {
        self.store.save(&self.batch)
    }
}

/// Convenience for binaries: restore an existing session or start a new one
pub fn restore_or_create(
    path: &Path,
    destination: &str,
    max_retries: u32,
) -> Result<SessionManager> {
    if let Some(manager) = SessionManager::restore(SessionStore::new(path), max_retries)? {
        info!(
            session_id = %manager.batch().session_id,
            pending = manager.batch().items.len(),
            "Resumed persisted upload session"
        );
        return Ok(manager);
    }

    Ok(SessionManager::create(
        SessionStore::new(path),
        destination,
        max_retries,
    ))
}
