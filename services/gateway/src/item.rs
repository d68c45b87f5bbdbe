use crate::object_store::StoreError;
use crate::photo_store::{PhotoRecord, RecordError};
use crate::transform::TransformError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Where an uploaded photo is destined within the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationContext {
    /// Client event gallery photo
    Event,
    /// Photographer portfolio piece
    Portfolio,
    /// Homepage hero slide
    Hero,
}

impl DestinationContext {
    /// Storage key prefix for this destination
    pub fn key_prefix(&self) -> &'static str {
        match self {
            DestinationContext::Event => "events",
            DestinationContext::Portfolio => "portfolio",
            DestinationContext::Hero => "hero",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationContext::Event => "event",
            DestinationContext::Portfolio => "portfolio",
            DestinationContext::Hero => "hero",
        }
    }
}

impl FromStr for DestinationContext {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(DestinationContext::Event),
            "portfolio" => Ok(DestinationContext::Portfolio),
            "hero" => Ok(DestinationContext::Hero),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DestinationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file of a decoded batch, ready for the pipeline
#[derive(Debug, Clone)]
pub struct IncomingFile {
    /// Client-assigned idempotency key for this item
    pub item_key: Uuid,
    /// Original filename as submitted (never used verbatim as a storage key)
    pub filename: String,
    /// Declared mime type from the multipart part
    pub content_type: String,
    /// Raw file bytes
    pub bytes: Bytes,
}

/// Pipeline stage an item was in when its attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validating,
    Transforming,
    Storing,
    Recording,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Validating => "validating",
            Stage::Transforming => "transforming",
            Stage::Storing => "storing",
            Stage::Recording => "recording",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a single item. Never aborts sibling items.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("file too large: {actual} bytes exceeds limit of {limit} bytes")]
    TooLarge { actual: u64, limit: u64 },

    #[error("content type not allowed: {0}")]
    DisallowedType(String),

    #[error("file content is not a recognized image format")]
    UnrecognizedContent,

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("storage failed: {0}")]
    Storage(#[from] StoreError),

    #[error("metadata insert failed: {0}")]
    Record(#[from] RecordError),

    #[error("pipeline worker failed: {0}")]
    Worker(String),
}

impl ItemError {
    /// The stage this error terminated the item in
    pub fn stage(&self) -> Stage {
        match self {
            ItemError::TooLarge { .. }
            | ItemError::DisallowedType(_)
            | ItemError::UnrecognizedContent => Stage::Validating,
            ItemError::Transform(_) | ItemError::Worker(_) => Stage::Transforming,
            ItemError::Storage(_) => Stage::Storing,
            ItemError::Record(_) => Stage::Recording,
        }
    }

    /// Whether the client may safely retry this item.
    ///
    /// Retries are safe for transient infrastructure failures because the
    /// metadata insert is idempotent on the item key. Validation and decode
    /// failures are properties of the bytes themselves and will never succeed.
    pub fn retryable(&self) -> bool {
        match self {
            ItemError::Storage(e) => e.is_transient(),
            ItemError::Record(_) => true,
            _ => false,
        }
    }
}

/// Terminal outcome of one item within a batch
#[derive(Debug)]
pub struct ItemOutcome {
    pub item_key: Uuid,
    pub filename: String,
    pub result: Result<PhotoRecord, ItemError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_round_trip() {
        for s in ["event", "portfolio", "hero"] {
            let ctx: DestinationContext = s.parse().unwrap();
            assert_eq!(ctx.as_str(), s);
        }
        assert!("gallery".parse::<DestinationContext>().is_err());
    }

    #[test]
    fn test_validation_errors_are_not_retryable() {
        let err = ItemError::TooLarge {
            actual: 60 * 1024 * 1024,
            limit: 50 * 1024 * 1024,
        };
        assert_eq!(err.stage(), Stage::Validating);
        assert!(!err.retryable());

        let err = ItemError::DisallowedType("application/pdf".to_string());
        assert!(!err.retryable());
    }

    #[test]
    fn test_transient_storage_errors_are_retryable() {
        let err = ItemError::Storage(StoreError::Transient("connection reset".to_string()));
        assert_eq!(err.stage(), Stage::Storing);
        assert!(err.retryable());

        let err = ItemError::Storage(StoreError::Permanent("access denied".to_string()));
        assert!(!err.retryable());
    }
}
