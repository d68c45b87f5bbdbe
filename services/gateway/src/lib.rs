//! Darkroom Ingestion Gateway
//!
//! Batch photo ingestion service for the Darkroom event photography
//! platform. The gateway authenticates a multipart batch, validates each
//! file independently, derives resized variants, persists the bytes to
//! object storage, and records metadata in PostgreSQL, isolating per-file
//! failure so one bad file never aborts a batch.
//!
//! ## Architecture
//!
//! ```text
//! Upload client               Object storage            PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ multipart    │           │ {dest}/      │          │ photos       │
//! │ batch POST   │──────────▶│   {date}/    │          │ (item_key    │
//! └──────────────┘           │   originals/ │          │  UNIQUE)     │
//!        │                   │   thumbnails/│          └──────────────┘
//!        ▼                   └──────────────┘                 ▲
//! ┌──────────────┐                  ▲                         │
//! │ Ingestion    │                  │                         │
//! │ Gateway      │                  │                         │
//! └──────────────┘                  │                         │
//!        │                          │                         │
//!        ▼                          │                         │
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Batch        │──────────▶│ Blob         │          │ Photo        │
//! │ Orchestrator │           │ Store        │          │ Store        │──┘
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                          ▲                         ▲
//!        ▼                          │                         │
//! ┌──────────────┐                  │                         │
//! │ Transform    │──────────────────┴─────────────────────────┘
//! │ Engine       │   (per item: validate → transform → store → record)
//! └──────────────┘
//! ```
//!
//! Each item within a batch is independent: failures are caught locally,
//! tagged with the stage they happened in, and reported per item. Metadata
//! inserts are idempotent on a client-assigned item key, which makes retries
//! after an unknown-outcome crash safe.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod item;
pub mod object_store;
pub mod orchestrator;
pub mod photo_store;
pub mod transform;

pub use auth::{AuthError, Identity, StaticTokenVerifier, TokenVerifier};
pub use config::Config;
pub use gateway::{AppState, ItemResponse, ThumbnailUrls};
pub use item::{DestinationContext, IncomingFile, ItemError, ItemOutcome, Stage};
pub use object_store::{BlobStore, ObjectKeys, S3BlobStore, StoreError};
pub use orchestrator::BatchOrchestrator;
pub use photo_store::{NewPhoto, PgPhotoStore, PhotoRecord, RecordStore};
pub use transform::{TransformEngine, TransformError, VariantSet};
