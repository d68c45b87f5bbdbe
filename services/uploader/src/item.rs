//! Client-side upload state: items, batches, and the per-item status
//! machine. Owned exclusively by the session manager; the server never
//! mutates any of this.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Status of one queued file.
///
/// Transitions are monotonic forward (queued → uploading → processing →
/// done), plus failure from any in-flight state and an explicit
/// failed → queued retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Uploading,
    Processing,
    Done,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            ItemStatus::Queued => 0,
            ItemStatus::Uploading => 1,
            ItemStatus::Processing => 2,
            ItemStatus::Done => 3,
            ItemStatus::Failed => 4,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition(&self, next: ItemStatus) -> bool {
        match (self, next) {
            // explicit retry
            (ItemStatus::Failed, ItemStatus::Queued) => true,
            // failure from any non-terminal state
            (from, ItemStatus::Failed) => !from.is_terminal(),
            // strict forward progress otherwise
            (from, to) => to.rank() == from.rank() + 1 && !from.is_terminal(),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Queued => "queued",
            ItemStatus::Uploading => "uploading",
            ItemStatus::Processing => "processing",
            ItemStatus::Done => "done",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One file tracked through the upload pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    /// Stable id assigned at enqueue time; doubles as the server-side
    /// idempotency key (filenames collide, ids do not)
    pub id: Uuid,
    /// Display filename
    pub filename: String,
    /// Local path of the file
    pub path: PathBuf,
    /// File size at enqueue time
    pub byte_size: u64,
    /// Declared mime type, derived from the extension
    pub mime_type: String,
    pub status: ItemStatus,
    pub progress_percent: u8,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl UploadItem {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        Ok(Self {
            id: Uuid::new_v4(),
            mime_type: mime_type_for(&filename).to_string(),
            filename,
            path: path.to_path_buf(),
            byte_size: metadata.len(),
            status: ItemStatus::Queued,
            progress_percent: 0,
            retry_count: 0,
            last_error: None,
        })
    }
}

/// Declared mime type from the file extension
pub fn mime_type_for(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// A batch of items tracked across one device session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatch {
    pub session_id: Uuid,
    pub destination: String,
    pub items: Vec<UploadItem>,
    pub created_at: DateTime<Utc>,
}

impl UploadBatch {
    pub fn new(destination: &str) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            destination: destination.to_string(),
            items: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Items still awaiting a send
    pub fn queued(&self) -> impl Iterator<Item = &UploadItem> {
        self.items
            .iter()
            .filter(|item| item.status == ItemStatus::Queued)
    }

    pub fn all_terminal(&self) -> bool {
        self.items.iter().all(|item| item.status.is_terminal())
    }
}

/// Per-item entry of the gateway's batch response
#[derive(Debug, Clone, Deserialize)]
pub struct ItemResult {
    pub item_key: Uuid,
    pub filename: String,
    pub success: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumbnails: Option<ThumbnailUrls>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub retryable: Option<bool>,
}

/// Thumbnail URLs for a committed photo
#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailUrls {
    pub small: String,
    pub medium: String,
    pub large: String,
}
