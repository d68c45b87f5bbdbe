use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the ingestion gateway
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// HTTP server configuration
    pub http: HttpConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Object storage configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Ingestion pipeline configuration
    pub pipeline: PipelineConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP server configuration for the upload API
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_http_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Authentication configuration
///
/// Tokens are opaque bearer credentials mapped to an uploader subject.
/// Issuance and rotation are handled outside this service.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Accepted upload tokens
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// A single accepted bearer token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    /// The bearer token value
    pub token: String,
    /// Subject the token authenticates as
    pub subject: String,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket name for photo storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Public base URL that stored objects are served from
    pub public_base_url: String,
    /// Initial delay between retries of transient storage errors
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// Give up retrying a storage write after this long
    #[serde(default = "default_retry_max_elapsed_secs")]
    pub retry_max_elapsed_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum size of a single file in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Maximum number of files in one batch request
    #[serde(default = "default_max_files_per_batch")]
    pub max_files_per_batch: usize,
    /// Allowed mime types for uploaded files
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
    /// Number of items processed concurrently across all requests
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Long-edge targets for derived variants
    #[serde(default)]
    pub variant_edges: VariantEdges,
    /// JPEG quality for encoded variants (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Reject images whose pixel count exceeds this (decompression bombs)
    #[serde(default = "default_max_input_pixels")]
    pub max_input_pixels: u64,
}

/// Long-edge pixel targets for the derived variant set
#[derive(Debug, Clone, Deserialize)]
pub struct VariantEdges {
    #[serde(default = "default_small_edge")]
    pub small: u32,
    #[serde(default = "default_medium_edge")]
    pub medium: u32,
    #[serde(default = "default_large_edge")]
    pub large: u32,
}

impl Default for VariantEdges {
    fn default() -> Self {
        Self {
            small: default_small_edge(),
            medium: default_medium_edge(),
            large: default_large_edge(),
        }
    }
}

// Default value functions
fn default_service_name() -> String {
    "darkroom-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_retry_initial_delay_ms() -> u64 {
    250
}

fn default_retry_max_elapsed_secs() -> u64 {
    20
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_max_files_per_batch() -> usize {
    100
}

fn default_allowed_mime_types() -> Vec<String> {
    vec![
        "image/jpeg".to_string(),
        "image/png".to_string(),
        "image/webp".to_string(),
    ]
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_max_input_pixels() -> u64 {
    268_402_689 // ~16K x 16K
}

fn default_small_edge() -> u32 {
    400
}

fn default_medium_edge() -> u32 {
    800
}

fn default_large_edge() -> u32 {
    1200
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "darkroom-gateway")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/gateway").required(false))
            .add_source(config::File::with_name("/etc/darkroom/gateway").required(false))
            // Override with environment variables
            // GATEWAY__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Request body ceiling for the upload endpoint: a full batch of
    /// maximum-size files plus multipart framing slack.
    pub fn body_limit_bytes(&self) -> usize {
        let files = self.pipeline.max_files_per_batch as u64;
        let ceiling = files
            .saturating_mul(self.pipeline.max_file_size_bytes)
            .saturating_add(1024 * 1024);
        usize::try_from(ceiling).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_file_size(), 50 * 1024 * 1024);
        assert_eq!(default_worker_concurrency(), 4);
        assert_eq!(default_allowed_mime_types().len(), 3);
    }

    #[test]
    fn test_body_limit_covers_full_batch() {
        let config = Config {
            service: ServiceConfig {
                name: default_service_name(),
                log_level: default_log_level(),
                metrics_port: default_metrics_port(),
            },
            http: HttpConfig {
                host: default_http_host(),
                port: default_http_port(),
                cors_enabled: true,
                cors_origins: vec![],
            },
            auth: AuthConfig { tokens: vec![] },
            s3: S3Config {
                bucket: "photos".to_string(),
                region: default_region(),
                endpoint_url: None,
                force_path_style: false,
                public_base_url: "https://cdn.example.com".to_string(),
                retry_initial_delay_ms: default_retry_initial_delay_ms(),
                retry_max_elapsed_secs: default_retry_max_elapsed_secs(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/darkroom".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout_secs(),
                idle_timeout_secs: default_idle_timeout_secs(),
                run_migrations: true,
            },
            pipeline: PipelineConfig {
                max_file_size_bytes: 10,
                max_files_per_batch: 3,
                allowed_mime_types: default_allowed_mime_types(),
                worker_concurrency: 2,
                variant_edges: VariantEdges::default(),
                jpeg_quality: default_jpeg_quality(),
                max_input_pixels: default_max_input_pixels(),
            },
        };

        assert!(config.body_limit_bytes() > 30);
    }
}
