use crate::auth::{bearer_token, TokenVerifier};
use crate::config::{HttpConfig, PipelineConfig};
use crate::item::{DestinationContext, IncomingFile, ItemError, ItemOutcome};
use crate::orchestrator::BatchOrchestrator;
use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sqlx::postgres::PgPool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BatchOrchestrator>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub pipeline: PipelineConfig,
    pub db_pool: PgPool,
}

/// Per-item entry of the batch response, in submission order
#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub item_key: Uuid,
    pub filename: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnails: Option<ThumbnailUrls>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

/// Thumbnail URLs for a committed photo
#[derive(Debug, Serialize)]
pub struct ThumbnailUrls {
    pub small: String,
    pub medium: String,
    pub large: String,
}

impl From<ItemOutcome> for ItemResponse {
    fn from(outcome: ItemOutcome) -> Self {
        match outcome.result {
            Ok(record) => Self {
                item_key: outcome.item_key,
                filename: outcome.filename,
                success: true,
                url: Some(record.original_url),
                thumbnails: Some(ThumbnailUrls {
                    small: record.thumbnail_small_url,
                    medium: record.thumbnail_medium_url,
                    large: record.thumbnail_large_url,
                }),
                width: Some(record.width),
                height: Some(record.height),
                error: None,
                stage: None,
                retryable: None,
            },
            Err(err) => Self {
                item_key: outcome.item_key,
                filename: outcome.filename,
                success: false,
                url: None,
                thumbnails: None,
                width: None,
                height: None,
                error: Some(err.to_string()),
                stage: Some(err.stage().as_str()),
                retryable: Some(err.retryable()),
            },
        }
    }
}

/// Error response for batch-wide rejections
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
            code: "UNAUTHORIZED".to_string(),
        }),
    )
}

fn bad_request(message: &str, code: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &HttpConfig, body_limit: usize) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/uploads/:destination", post(upload_batch))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "darkroom-gateway"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(&state.db_pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Batch upload endpoint.
///
/// Authentication and envelope problems reject the whole request before any
/// file is touched; everything after that is per-item. Mixed outcomes return
/// 200 with success/failure carried inside the body so one bad file does not
/// mask the rest of the batch.
#[instrument(skip_all, fields(destination = %destination))]
async fn upload_batch(
    State(state): State<AppState>,
    Path(destination): Path<String>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<Vec<ItemResponse>>, ApiError> {
    // Authenticate first
    let token = bearer_token(&headers).ok_or_else(|| unauthorized("missing bearer token"))?;
    let identity = state
        .verifier
        .verify(token)
        .await
        .map_err(|e| unauthorized(&e.to_string()))?;

    let destination: DestinationContext = destination
        .parse()
        .map_err(|_| bad_request("unknown destination context", "BAD_DESTINATION"))?;

    // Decode the multipart envelope
    let files = read_batch(multipart)
        .await
        .map_err(|e| bad_request(&e, "MALFORMED_BATCH"))?;

    if files.is_empty() {
        return Err(bad_request("no files provided", "EMPTY_BATCH"));
    }

    if files.len() > state.pipeline.max_files_per_batch {
        return Err(bad_request(
            &format!(
                "too many files: {} exceeds limit of {}",
                files.len(),
                state.pipeline.max_files_per_batch
            ),
            "BATCH_TOO_LARGE",
        ));
    }

    info!(
        subject = %identity.subject,
        destination = %destination,
        files = files.len(),
        "Accepted upload batch"
    );
    metrics::counter!("ingest.batches.accepted").increment(1);

    // Cheap per-item checks before the transform engine sees anything
    let mut rejected: Vec<(usize, ItemOutcome)> = Vec::new();
    let mut accepted: Vec<(usize, IncomingFile)> = Vec::new();

    for (idx, file) in files.into_iter().enumerate() {
        match cheap_check(&file, &state.pipeline) {
            Some(err) => {
                warn!(filename = %file.filename, error = %err, "Item rejected before processing");
                metrics::counter!("ingest.items.rejected").increment(1);
                rejected.push((
                    idx,
                    ItemOutcome {
                        item_key: file.item_key,
                        filename: file.filename,
                        result: Err(err),
                    },
                ));
            }
            None => accepted.push((idx, file)),
        }
    }

    let accepted_indices: Vec<usize> = accepted.iter().map(|(idx, _)| *idx).collect();
    let survivors: Vec<IncomingFile> = accepted.into_iter().map(|(_, file)| file).collect();

    let processed = state.orchestrator.process(destination, survivors).await;

    let outcomes = merge_outcomes(rejected, accepted_indices, processed);
    Ok(Json(outcomes.into_iter().map(ItemResponse::from).collect()))
}

/// Decode all file parts of the multipart payload.
///
/// The part name carries the client-assigned idempotency key; parts without
/// a parseable key get a fresh one (and lose retry idempotency).
async fn read_batch(mut multipart: Multipart) -> Result<Vec<IncomingFile>, String> {
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("invalid multipart payload: {e}"))?
    {
        let Some(filename) = field.file_name().map(ToString::to_string) else {
            // Non-file fields carry no batch content
            continue;
        };

        let name = field.name().unwrap_or_default().to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = field
            .bytes()
            .await
            .map_err(|e| format!("failed to read file part '{filename}': {e}"))?;

        let item_key = name.parse().unwrap_or_else(|_| Uuid::new_v4());

        files.push(IncomingFile {
            item_key,
            filename,
            content_type,
            bytes,
        });
    }

    Ok(files)
}

/// Per-item checks that run before any pipeline work: declared size and
/// mime type. Failures reject the single item, never the batch.
fn cheap_check(file: &IncomingFile, pipeline: &PipelineConfig) -> Option<ItemError> {
    let size = file.bytes.len() as u64;
    if size > pipeline.max_file_size_bytes {
        return Some(ItemError::TooLarge {
            actual: size,
            limit: pipeline.max_file_size_bytes,
        });
    }

    if !pipeline
        .allowed_mime_types
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&file.content_type))
    {
        return Some(ItemError::DisallowedType(file.content_type.clone()));
    }

    None
}

/// Re-key gateway rejections and orchestrator outcomes back to submission
/// order. `accepted_indices[i]` is the original position of `processed[i]`.
fn merge_outcomes(
    rejected: Vec<(usize, ItemOutcome)>,
    accepted_indices: Vec<usize>,
    processed: Vec<ItemOutcome>,
) -> Vec<ItemOutcome> {
    let mut merged = rejected;
    merged.extend(accepted_indices.into_iter().zip(processed));
    merged.sort_by_key(|(idx, _)| *idx);
    merged.into_iter().map(|(_, outcome)| outcome).collect()
}

/// Start the upload API server
pub async fn start_api_server(
    state: AppState,
    config: &HttpConfig,
    body_limit: usize,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config, body_limit);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
