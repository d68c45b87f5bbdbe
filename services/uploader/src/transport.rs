//! Network transport for single-item uploads.
//!
//! Streams the file body chunk by chunk through a progress observer,
//! supports cooperative cancellation, and hands any completed HTTP exchange
//! back unchanged so the session manager can interpret the gateway's
//! per-item body. Only connection-level failures are classified as
//! retryable here.

use crate::config::UploaderConfig;
use crate::item::{ItemResult, UploadItem};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::multipart;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Progress observer invoked once per buffered chunk with (loaded, total)
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The caller abandoned the upload; the connection has been released
    #[error("upload cancelled")]
    Cancelled,

    /// The file could not be read from disk
    #[error("file read failed: {0}")]
    File(String),

    /// Connection-level failure before a response arrived; retryable
    #[error("network error: {0}")]
    Network(String),

    /// The request could not be constructed; not retryable
    #[error("invalid request: {0}")]
    Request(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}

/// A completed HTTP exchange, passed through uninterpreted
#[derive(Debug)]
pub struct SendResponse {
    pub status: u16,
    pub body: String,
}

impl SendResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Parse the gateway's per-item result array
    pub fn item_results(&self) -> Result<Vec<ItemResult>, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// HTTP transport for the upload API
pub struct Transport {
    client: reqwest::Client,
    endpoint: String,
    auth_token: String,
    chunk_size: usize,
}

impl Transport {
    pub fn new(config: &UploaderConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            chunk_size: config.chunk_size_bytes.max(1),
        })
    }

    /// Upload one item, reporting byte-level progress per chunk.
    ///
    /// The multipart part is named with the item id so the gateway can use
    /// it as the idempotency key. Cancelling drops the in-flight request,
    /// which releases the underlying connection.
    #[instrument(skip(self, item, on_progress, cancel), fields(id = %item.id, filename = %item.filename))]
    pub async fn send_item(
        &self,
        item: &UploadItem,
        destination: &str,
        on_progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<SendResponse, TransportError> {
        let bytes = tokio::fs::read(&item.path)
            .await
            .map_err(|e| TransportError::File(e.to_string()))?;
        let total = bytes.len() as u64;

        let body = reqwest::Body::wrap_stream(progress_stream(
            bytes,
            self.chunk_size,
            total,
            on_progress,
        ));

        let part = multipart::Part::stream_with_length(body, total)
            .file_name(item.filename.clone())
            .mime_str(&item.mime_type)
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let form = multipart::Form::new().part(item.id.to_string(), part);

        let url = format!("{}/api/v1/uploads/{}", self.endpoint, destination);
        debug!(url = %url, size_bytes = total, "Sending upload request");

        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.auth_token)
            .multipart(form);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = request.send() => result.map_err(classify_reqwest_error)?,
        };

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(classify_reqwest_error)?;

        debug!(status = status, "Upload request completed");

        Ok(SendResponse { status, body })
    }
}

/// Wrap file bytes in a chunked stream that reports cumulative progress
fn progress_stream(
    bytes: Vec<u8>,
    chunk_size: usize,
    total: u64,
    on_progress: ProgressFn,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let chunks: Vec<Bytes> = bytes
        .chunks(chunk_size)
        .map(Bytes::copy_from_slice)
        .collect();

    let mut loaded: u64 = 0;
    futures::stream::iter(chunks).map(move |chunk| {
        loaded += chunk.len() as u64;
        on_progress(loaded, total);
        Ok(chunk)
    })
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_builder() {
        TransportError::Request(err.to_string())
    } else {
        // connect/timeout/body failures are connection-level and retryable
        TransportError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_progress_stream_reassembles_input() {
        let input: Vec<u8> = (0..=255).collect();
        let observed: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));

        let observer = observed.clone();
        let on_progress: ProgressFn =
            Box::new(move |loaded, total| observer.lock().unwrap().push((loaded, total)));

        let chunks: Vec<Result<Bytes, std::io::Error>> =
            progress_stream(input.clone(), 100, 256, on_progress)
                .collect()
                .await;

        let reassembled: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        assert_eq!(reassembled, input);

        // 256 bytes in 100-byte chunks: progress fires at 100, 200, 256
        let calls = observed.lock().unwrap().clone();
        assert_eq!(calls, vec![(100, 256), (200, 256), (256, 256)]);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_reaches_total() {
        let input = vec![7u8; 10_000];
        let observed: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));

        let observer = observed.clone();
        let on_progress: ProgressFn =
            Box::new(move |loaded, total| observer.lock().unwrap().push((loaded, total)));

        let _: Vec<_> = progress_stream(input, 4096, 10_000, on_progress)
            .collect()
            .await;

        let calls = observed.lock().unwrap().clone();
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(calls.last(), Some(&(10_000, 10_000)));
    }

    #[test]
    fn test_transport_error_retryability() {
        assert!(TransportError::Network("connection reset".into()).is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
        assert!(!TransportError::Request("bad mime".into()).is_retryable());
        assert!(!TransportError::File("not found".into()).is_retryable());
    }

    #[test]
    fn test_send_response_parses_item_results() {
        let response = SendResponse {
            status: 200,
            body: r#"[{"item_key":"550e8400-e29b-41d4-a716-446655440000",
                       "filename":"a.jpg","success":true,"url":"https://cdn/a.jpg"}]"#
                .to_string(),
        };

        assert!(response.is_ok());
        let results = response.item_results().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }

    #[test]
    fn test_send_response_passes_non_2xx_through() {
        let response = SendResponse {
            status: 401,
            body: r#"{"error":"invalid token","code":"UNAUTHORIZED"}"#.to_string(),
        };

        assert!(!response.is_ok());
        assert!(response.item_results().is_err());
    }
}
