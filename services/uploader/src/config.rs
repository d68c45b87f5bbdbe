//! Configuration for the upload client.
//!
//! Loaded from a config file (`config/uploader`) and environment variables
//! prefixed with `UPLOADER__`.

use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the upload client
#[derive(Debug, Clone, Deserialize)]
pub struct UploaderConfig {
    /// Base URL of the ingestion gateway (e.g. "https://ingest.example.com")
    pub endpoint: String,

    /// Bearer token for the upload API
    pub auth_token: String,

    /// Destination context uploads go to (event, portfolio, hero)
    #[serde(default = "default_destination")]
    pub destination: String,

    /// Path of the persisted upload queue
    #[serde(default = "default_queue_path")]
    pub queue_path: String,

    /// Retry ceiling per item; items beyond it are surfaced, not re-queued
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Chunk size for progress-reporting uploads
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_destination() -> String {
    "event".to_string()
}

fn default_queue_path() -> String {
    ".darkroom-upload.json".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl UploaderConfig {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/uploader").required(false))
            .add_source(
                config::Environment::with_prefix("UPLOADER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
